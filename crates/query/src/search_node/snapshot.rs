//! View snapshot acquisition
//!
//! Single servers read every linked collection through one snapshot per
//! view and transaction, and may reuse the snapshot the transaction took
//! when it began. Data servers only see their local shards: each shard is
//! resolved to its local index and locked individually.
//!
//! A search restricted to some collections caches its snapshot under its
//! own node identity, so two restricted reads of the same view inside one
//! query never share (or clobber) each other's snapshot.

use super::SearchNode;
use crate::context::QueryContext;
use std::sync::Arc;
use tessera_core::{DataSourceId, Error, OutOfSyncPolicy, Result, ServerRole};
use tessera_search::view_snapshot::{get_view_snapshot, make_view_snapshot};
use tessera_search::{CacheKey, LockedLink, Transaction, ViewSnapshot};
use tracing::{trace, warn};

impl SearchNode {
    /// Key the node's snapshot is cached under on the transaction
    pub fn snapshot_key(&self) -> CacheKey {
        if self.options.restrict_sources {
            CacheKey::Node(self.view.id(), self.id)
        } else {
            CacheKey::View(self.view.id())
        }
    }

    fn restriction(&self) -> Option<Vec<DataSourceId>> {
        self.options
            .restrict_sources
            .then(|| self.options.sources.iter().copied().collect())
    }

    /// Snapshot the node reads from inside `trx`
    pub fn snapshot(&self, ctx: &QueryContext, trx: &Transaction) -> Result<Arc<ViewSnapshot>> {
        trx.ensure_running()?;
        if self.options.force_sync && trx.options().globally_managed {
            return Err(Error::bad_parameter(
                "cannot use waitForSync with view and streaming or js transaction",
            ));
        }
        trace!(target: "tessera::snapshot", view = %self.view.name(), node = %self.id, "acquiring view snapshot");
        self.check_out_of_sync(ctx)?;
        let snapshot = match ctx.role() {
            ServerRole::DbServer => self.snapshot_db_server(ctx, trx),
            _ => self.snapshot_single_server(trx),
        };
        snapshot.map_err(|e| {
            warn!(
                target: "tessera::snapshot",
                view = %self.view.name(),
                error = %e,
                "failed to get view snapshot"
            );
            e
        })
    }

    fn snapshot_single_server(&self, trx: &Transaction) -> Result<Arc<ViewSnapshot>> {
        let key = self.snapshot_key();
        let restriction = self.restriction();

        if let Some(cached) = get_view_snapshot(trx, &key) {
            if !self.options.force_sync {
                return Ok(cached);
            }
            let links = self.view.lock_links(restriction.as_deref())?;
            return make_view_snapshot(trx, &key, true, &links);
        }

        if restriction.is_none() && !self.options.force_sync && trx.options().main {
            if let Some(implicit) = trx.implicit_snapshot(self.view.id()) {
                return Ok(implicit);
            }
        }

        let links = self.view.lock_links(restriction.as_deref())?;
        make_view_snapshot(trx, &key, self.options.force_sync, &links)
    }

    fn snapshot_db_server(&self, ctx: &QueryContext, trx: &Transaction) -> Result<Arc<ViewSnapshot>> {
        let key = self.snapshot_key();
        if !self.options.force_sync {
            if let Some(cached) = get_view_snapshot(trx, &key) {
                return Ok(cached);
            }
        }

        let catalog = ctx.catalog();
        let mut links = Vec::new();
        for (shard, indexes) in &self.shards {
            let collection = catalog
                .shard(shard)
                .ok_or_else(|| Error::not_found(format!("failed to find shard by id '{}'", shard)))?;
            if !self.admits(ctx, &collection) {
                continue;
            }
            for index in indexes {
                let handle = collection.index(*index).ok_or_else(|| {
                    Error::not_found(format!("failed to find index '{}' of shard '{}'", index, shard))
                })?;
                let store = handle.lock().ok_or_else(|| {
                    Error::internal(format!(
                        "failed to lock index '{}' of shard '{}' while reading view '{}'",
                        index,
                        shard,
                        self.view.name()
                    ))
                })?;
                links.push(LockedLink {
                    source: collection.id(),
                    index: *index,
                    store,
                });
            }
        }
        make_view_snapshot(trx, &key, self.options.force_sync, &links)
    }

    /// Refuse (or warn about) reads of indexes marked out of sync
    fn check_out_of_sync(&self, ctx: &QueryContext) -> Result<()> {
        for link in self.view.links() {
            let admitted = ctx
                .catalog()
                .collection(link.collection)
                .map_or(true, |c| self.admits(ctx, &c));
            if !admitted {
                continue;
            }
            let Some(store) = link.store.lock() else {
                continue;
            };
            if !store.is_out_of_sync() {
                continue;
            }
            let msg = format!(
                "link {} of view '{}' is out of sync and needs to be recreated",
                link.index,
                self.view.name()
            );
            match ctx.config().out_of_sync_policy {
                OutOfSyncPolicy::Fail => return Err(Error::out_of_sync(msg)),
                OutOfSyncPolicy::Warn => {
                    warn!(target: "tessera::search", view = %self.view.name(), index = %link.index, "reading index that is out of sync");
                    ctx.warn(msg);
                }
            }
        }
        Ok(())
    }
}

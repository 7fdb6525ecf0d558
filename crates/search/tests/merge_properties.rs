//! Merge iterator properties
//!
//! These tests verify that merging locally sorted segments:
//! 1. Emits every live matching document exactly once
//! 2. Emits them in global primary-sort order, for any sort direction
//! 3. Honours deletions and filters the same way segment-order iteration does

use proptest::prelude::*;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tessera_core::{DataSourceId, FieldValue, IndexId, IndexMeta, LocalDocumentId};
use tessera_search::{
    Filter, Materializer, MergeIterator, PreparedSearch, ReadShape, RetrievalIterator, SearchIterator, ViewSnapshot,
};
use tessera_storage::column::decode_record;
use tessera_storage::{DataSnapshot, Segment, SegmentBuilder};

type Key = Vec<Option<FieldValue>>;

fn meta(asc_a: bool, asc_b: bool) -> IndexMeta {
    IndexMeta::from_json(&json!({
        "primarySort": [{"field": "a", "asc": asc_a}, {"field": "b", "asc": asc_b}],
    }))
    .unwrap()
}

/// One data snapshot per source, one segment per inner vector
fn build(meta: &IndexMeta, sources: &[Vec<Vec<(Value, bool)>>]) -> Arc<ViewSnapshot> {
    let shared = Arc::new(meta.clone());
    let mut pk = 0u64;
    let mut entries = Vec::new();
    for (s, segments) in sources.iter().enumerate() {
        let mut segs = Vec::new();
        for (i, docs) in segments.iter().enumerate() {
            let mut b = SegmentBuilder::new(Arc::clone(&shared));
            let mut doomed = Vec::new();
            for (doc, deleted) in docs {
                pk += 1;
                b.add(LocalDocumentId(pk), doc);
                if *deleted {
                    doomed.push(LocalDocumentId(pk));
                }
            }
            let seg = Segment::new(Arc::new(b.build(i as u64 + 1)));
            let mask = doomed.iter().filter_map(|pk| seg.find_pk(*pk)).collect();
            segs.push(seg.with_deletions(mask));
        }
        entries.push((
            DataSourceId(s as u64 + 1),
            IndexId(s as u64 + 100),
            Arc::new(DataSnapshot::new(segs, 1, 1)),
        ));
    }
    Arc::new(ViewSnapshot::from_snapshots(entries))
}

fn drain(it: &mut dyn SearchIterator) -> Vec<(DataSourceId, LocalDocumentId, usize, u32)> {
    let mut out = Vec::new();
    loop {
        let more = it
            .next_hits(3, &mut |h| out.push((h.source, h.pk.unwrap(), h.segment, h.doc)))
            .unwrap();
        if !more {
            break;
        }
    }
    out
}

fn key_of(snap: &ViewSnapshot, segment: usize, doc: u32) -> Key {
    let record = snap.segment(segment).sort_record(doc).unwrap();
    decode_record(record, 2).unwrap()
}

fn pk_materializer() -> Materializer {
    Materializer::new(ReadShape::Ids, None, true).unwrap()
}

fn doc_strategy() -> impl Strategy<Value = (Value, bool)> {
    (
        prop::option::of(0i64..6),
        prop::option::of(prop::sample::select(vec!["x", "y", "z"])),
        any::<bool>(),
        prop::bool::weighted(0.2),
    )
        .prop_map(|(a, b, red, deleted)| {
            let mut doc = serde_json::Map::new();
            if let Some(a) = a {
                doc.insert("a".into(), json!(a));
            }
            if let Some(b) = b {
                doc.insert("b".into(), json!(b));
            }
            doc.insert("color".into(), json!(if red { "red" } else { "blue" }));
            (Value::Object(doc), deleted)
        })
}

// === Fixed Cases ===

#[test]
fn test_missing_values_sort_first() {
    let meta = meta(true, true);
    let snap = build(
        &meta,
        &[vec![
            vec![(json!({"a": 2}), false), (json!({"b": "x"}), false)],
            vec![(json!({"a": 1, "b": "y"}), false)],
        ]],
    );
    let prepared = PreparedSearch::prepare(Arc::clone(&snap), vec![], Filter::all(), vec![], 1).unwrap();
    let mut it = MergeIterator::new(prepared, pk_materializer(), meta.primary_sort.clone(), 0).unwrap();
    let hits = drain(&mut it);
    let keys: Vec<Key> = hits.iter().map(|h| key_of(&snap, h.2, h.3)).collect();
    assert_eq!(keys[0][0], None);
    assert_eq!(keys[1][0], Some(FieldValue::Number(1.0)));
    assert_eq!(keys[2][0], Some(FieldValue::Number(2.0)));
}

#[test]
fn test_buckets_limit_compared_fields() {
    let meta = meta(true, true);
    let snap = build(
        &meta,
        &[vec![
            vec![(json!({"a": 1, "b": "z"}), false)],
            vec![(json!({"a": 1, "b": "x"}), false)],
            vec![(json!({"a": 0, "b": "y"}), false)],
        ]],
    );
    let prepared = PreparedSearch::prepare(Arc::clone(&snap), vec![], Filter::all(), vec![], 1).unwrap();
    let mut it = MergeIterator::new(prepared, pk_materializer(), meta.primary_sort.clone(), 1).unwrap();
    let hits = drain(&mut it);
    assert_eq!(hits.len(), 3);
    assert_eq!(key_of(&snap, hits[0].2, hits[0].3)[0], Some(FieldValue::Number(0.0)));
}

// === Properties ===

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_merge_is_sorted_and_complete(
        sources in prop::collection::vec(
            prop::collection::vec(prop::collection::vec(doc_strategy(), 0..8), 0..4),
            1..3,
        ),
        asc_a in any::<bool>(),
        asc_b in any::<bool>(),
        only_red in any::<bool>(),
        parallelism in 1usize..3,
    ) {
        let meta = meta(asc_a, asc_b);
        let snap = build(&meta, &sources);
        let filter = if only_red {
            Filter::Term { field: "color".into(), value: "red".into(), boost: 1.0 }
        } else {
            Filter::all()
        };

        let plain = PreparedSearch::prepare(Arc::clone(&snap), vec![], filter.clone(), vec![], 1).unwrap();
        let mut plain = RetrievalIterator::new(plain, pk_materializer());
        let expected = drain(&mut plain);

        let merged = PreparedSearch::prepare(Arc::clone(&snap), vec![], filter, vec![], parallelism).unwrap();
        let mut merged = MergeIterator::new(merged, pk_materializer(), meta.primary_sort.clone(), 0).unwrap();
        let actual = drain(&mut merged);

        // Count-preserving: same multiset of documents
        let count = |hits: &[(DataSourceId, LocalDocumentId, usize, u32)]| {
            let mut m: BTreeMap<(DataSourceId, LocalDocumentId), usize> = BTreeMap::new();
            for h in hits {
                *m.entry((h.0, h.1)).or_default() += 1;
            }
            m
        };
        prop_assert_eq!(count(&actual), count(&expected));
        prop_assert!(count(&actual).values().all(|n| *n == 1));

        // Globally sorted
        for pair in actual.windows(2) {
            let a = key_of(&snap, pair[0].2, pair[0].3);
            let b = key_of(&snap, pair[1].2, pair[1].3);
            prop_assert_ne!(meta.primary_sort.compare(&a, &b, 2), Ordering::Greater);
        }
    }
}

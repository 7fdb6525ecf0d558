//! `SEARCH ... OPTIONS {...}` parsing and persistence
//!
//! Options arrive as an object expression. Every recognized key has its own
//! handler in a table built once per process; unknown keys only produce a
//! warning. Values must be constant: per-row option values are rejected.

use crate::context::QueryContext;
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use tessera_core::{DataSourceId, Error, Expr, ExprArena, ExprId, Result};
use tessera_search::{ConditionOptimization, CountApproximate, SearchView, FILTER_OPTIMIZATION_MAX};
use tracing::warn;

/// Per-query search options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOptions {
    /// Read only the sources in `sources`
    pub restrict_sources: bool,
    /// Allowed sources when `restrict_sources` is set
    pub sources: BTreeSet<DataSourceId>,
    /// Commit linked stores before reading (`waitForSync`)
    pub force_sync: bool,
    /// Do not read documents at all
    pub no_materialization: bool,
    /// How `skip_all` counts
    pub count_approximate: CountApproximate,
    /// Condition normalization mode
    pub condition_optimization: ConditionOptimization,
    /// Filter optimization level, `-1` for the maximum
    pub filter_optimization: i64,
    /// Segment-processing threads
    pub parallelism: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        SearchOptions {
            restrict_sources: false,
            sources: BTreeSet::new(),
            force_sync: false,
            no_materialization: false,
            count_approximate: CountApproximate::Exact,
            condition_optimization: ConditionOptimization::Auto,
            filter_optimization: FILTER_OPTIMIZATION_MAX,
            parallelism: 1,
        }
    }
}

// ============================================================================
// Query-time parsing
// ============================================================================

struct ParseEnv<'a> {
    ctx: &'a QueryContext,
    view: &'a SearchView,
}

type OptionHandler = fn(&ParseEnv<'_>, &Value, &mut SearchOptions) -> std::result::Result<(), String>;

static HANDLERS: Lazy<HashMap<&'static str, OptionHandler>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, OptionHandler> = HashMap::new();
    m.insert("collections", parse_collections);
    m.insert("waitForSync", |_, v, o| {
        o.force_sync = v
            .as_bool()
            .ok_or("boolean value expected for option 'waitForSync'")?;
        Ok(())
    });
    m.insert("noMaterialization", |_, v, o| {
        o.no_materialization = v
            .as_bool()
            .ok_or("boolean value expected for option 'noMaterialization'")?;
        Ok(())
    });
    m.insert("countApproximate", |_, v, o| {
        let s = v
            .as_str()
            .ok_or("string value expected for option 'countApproximate'")?;
        o.count_approximate = CountApproximate::parse(s)
            .ok_or_else(|| format!("unknown value '{}' for option 'countApproximate'", s))?;
        Ok(())
    });
    m.insert("conditionOptimization", |_, v, o| {
        let s = v
            .as_str()
            .ok_or("string value expected for option 'conditionOptimization'")?;
        o.condition_optimization = ConditionOptimization::parse(s)
            .ok_or_else(|| format!("unknown value '{}' for option 'conditionOptimization'", s))?;
        Ok(())
    });
    m.insert("filterOptimization", |_, v, o| {
        o.filter_optimization = v
            .as_i64()
            .ok_or("int value expected for option 'filterOptimization'")?;
        Ok(())
    });
    m.insert("parallelism", |_, v, o| {
        let n = v
            .as_i64()
            .ok_or("int value expected for option 'parallelism'")?;
        if n <= 0 {
            return Err("positive value expected for option 'parallelism'".into());
        }
        o.parallelism = n as usize;
        Ok(())
    });
    m
});

const COLLECTIONS_TYPE_ERROR: &str = "null value or array of strings or numbers is expected for option 'collections'";

fn parse_collections(env: &ParseEnv<'_>, value: &Value, options: &mut SearchOptions) -> std::result::Result<(), String> {
    let items = match value {
        Value::Null => return Ok(()),
        Value::Array(items) => items,
        _ => return Err(COLLECTIONS_TYPE_ERROR.into()),
    };
    let catalog = env.ctx.catalog();
    let mut sources = BTreeSet::new();
    for item in items {
        match item {
            Value::Number(n) => {
                let id = n.as_u64().ok_or(COLLECTIONS_TYPE_ERROR)?;
                sources.insert(DataSourceId(id));
            }
            Value::String(name) => {
                let collection = catalog
                    .collection_by_name(name)
                    .or_else(|| name.parse::<u64>().ok().and_then(|id| catalog.collection(DataSourceId(id))))
                    .ok_or_else(|| format!("invalid data source name '{}' while parsing option 'collections'", name))?;
                sources.insert(collection.id());
            }
            _ => return Err(COLLECTIONS_TYPE_ERROR.into()),
        }
    }

    let unknown: Vec<String> = sources
        .iter()
        .filter(|id| !env.view.is_linked(**id))
        .map(|id| id.to_string())
        .collect();
    if !unknown.is_empty() {
        return Err(format!(
            "only {} out of {} provided collection(s) in option 'collections' are registered with the view '{}', unknown: {}",
            sources.len() - unknown.len(),
            sources.len(),
            env.view.name(),
            unknown.join(", ")
        ));
    }
    options.sources = sources;
    options.restrict_sources = true;
    Ok(())
}

/// Parse the options object expression `options` of a search over `view`.
///
/// Starts from the configured default parallelism. Unknown keys are
/// reported through the query context and skipped.
pub fn parse_options(
    ctx: &QueryContext,
    view: &SearchView,
    arena: &ExprArena,
    options: Option<ExprId>,
) -> Result<SearchOptions> {
    let mut parsed = SearchOptions {
        parallelism: ctx.config().default_parallelism,
        ..SearchOptions::default()
    };
    let Some(options) = options else {
        return Ok(parsed);
    };
    let invalid = |msg: &str| Error::bad_parameter(format!("invalid search options provided: {}", msg));
    let Expr::Object(members) = arena.get(options) else {
        return Err(invalid("options must be an object"));
    };
    let env = ParseEnv { ctx, view };
    for (name, value) in members {
        let Some(handler) = HANDLERS.get(name.as_str()) else {
            warn!(target: "tessera::search", option = %name, view = %view.name(), "unknown search option ignored");
            ctx.warn(format!("unknown attribute '{}' in OPTIONS of FOR", name));
            continue;
        };
        if !arena.is_constant(*value) {
            return Err(invalid(&format!("non-constant value for option '{}'", name)));
        }
        let value = arena.evaluate_constant(*value).map_err(|e| invalid(&e.to_string()))?;
        handler(&env, &value, &mut parsed).map_err(|e| invalid(&e))?;
    }
    Ok(parsed)
}

// ============================================================================
// Persistence
// ============================================================================

impl SearchOptions {
    /// Persisted form; defaults of the optional keys are omitted
    pub fn to_json(&self) -> Value {
        let mut m = Map::new();
        m.insert("waitForSync".into(), json!(self.force_sync));
        m.insert(
            "conditionOptimization".into(),
            json!(self.condition_optimization.as_str()),
        );
        if self.restrict_sources {
            let ids: Vec<u64> = self.sources.iter().map(|id| id.get()).collect();
            m.insert("collections".into(), json!(ids));
        } else {
            m.insert("collections".into(), Value::Null);
        }
        if self.no_materialization {
            m.insert("noMaterialization".into(), json!(true));
        }
        if self.count_approximate != CountApproximate::Exact {
            m.insert(
                "countApproximate".into(),
                json!(self.count_approximate.as_str()),
            );
        }
        if self.filter_optimization != FILTER_OPTIMIZATION_MAX {
            m.insert(
                "filterOptimization".into(),
                json!(self.filter_optimization),
            );
        }
        if self.parallelism != 1 {
            m.insert("parallelism".into(), json!(self.parallelism));
        }
        Value::Object(m)
    }

    /// Parse the persisted form. Missing keys keep their defaults.
    pub fn from_json(v: &Value) -> Result<Self> {
        Self::read_json(v).ok_or_else(|| {
            Error::bad_parameter(format!("failed to parse search node options: {}", v))
        })
    }

    fn read_json(v: &Value) -> Option<Self> {
        let mut options = SearchOptions::default();
        let obj = v.as_object()?;
        if let Some(sync) = obj.get("waitForSync") {
            options.force_sync = sync.as_bool()?;
        }
        match obj.get("conditionOptimization") {
            None | Some(Value::Null) => {}
            Some(mode) => options.condition_optimization = ConditionOptimization::parse(mode.as_str()?)?,
        }
        match obj.get("collections") {
            None | Some(Value::Null) => {}
            Some(ids) => {
                for id in ids.as_array()? {
                    let id = id.as_u64().filter(|id| *id != 0)?;
                    options.sources.insert(DataSourceId(id));
                }
                options.restrict_sources = true;
            }
        }
        if let Some(flag) = obj.get("noMaterialization") {
            options.no_materialization = flag.as_bool()?;
        }
        if let Some(mode) = obj.get("countApproximate") {
            options.count_approximate = CountApproximate::parse(mode.as_str()?)?;
        }
        if let Some(level) = obj.get("filterOptimization") {
            options.filter_optimization = level.as_i64()?;
        }
        if let Some(n) = obj.get("parallelism") {
            options.parallelism = n.as_u64()? as usize;
        }
        Some(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_core::{IndexMeta, SearchConfig, ServerRole};
    use tessera_search::Catalog;

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: QueryContext,
        view: Arc<SearchView>,
        c1: DataSourceId,
        c2: DataSourceId,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(Catalog::new(ServerRole::Single, dir.path()));
        let c1 = catalog.create_collection("c1").unwrap();
        let c2 = catalog.create_collection("c2").unwrap();
        catalog.create_collection("other").unwrap();
        let view = catalog.create_view("v", IndexMeta::default()).unwrap();
        catalog.link(&view, &c1).unwrap();
        catalog.link(&view, &c2).unwrap();
        let config = SearchConfig {
            default_parallelism: 3,
            ..SearchConfig::default()
        };
        Fixture {
            _dir: dir,
            ctx: QueryContext::new(catalog, config),
            view,
            c1: c1.id(),
            c2: c2.id(),
        }
    }

    fn parse(f: &Fixture, options: Value) -> Result<SearchOptions> {
        let mut arena = ExprArena::new();
        let id = arena.object_from_json(&options);
        parse_options(&f.ctx, &f.view, &arena, Some(id))
    }

    #[test]
    fn test_defaults_take_config_parallelism() {
        let f = fixture();
        let parsed = parse_options(&f.ctx, &f.view, &ExprArena::new(), None).unwrap();
        assert_eq!(parsed.parallelism, 3);
        assert!(!parsed.restrict_sources);
    }

    #[test]
    fn test_every_option_applied() {
        let f = fixture();
        let parsed = parse(
            &f,
            json!({
                "waitForSync": true,
                "noMaterialization": true,
                "countApproximate": "cost",
                "conditionOptimization": "nodnf",
                "filterOptimization": 0,
                "parallelism": 4,
                "collections": ["c1"],
            }),
        )
        .unwrap();
        assert!(parsed.force_sync);
        assert!(parsed.no_materialization);
        assert_eq!(parsed.count_approximate, CountApproximate::Cost);
        assert_eq!(parsed.condition_optimization, ConditionOptimization::NoDnf);
        assert_eq!(parsed.filter_optimization, 0);
        assert_eq!(parsed.parallelism, 4);
        assert!(parsed.restrict_sources);
        assert_eq!(parsed.sources.iter().copied().collect::<Vec<_>>(), vec![f.c1]);
    }

    #[test]
    fn test_collections_by_id_and_id_string() {
        let f = fixture();
        let parsed = parse(&f, json!({"collections": [f.c2.get(), f.c1.to_string()]})).unwrap();
        assert_eq!(parsed.sources.len(), 2);
        let parsed = parse(&f, json!({"collections": null})).unwrap();
        assert!(!parsed.restrict_sources);
    }

    #[test]
    fn test_collections_errors() {
        let f = fixture();
        let err = parse(&f, json!({"collections": ["missing"]})).unwrap_err();
        assert!(err.to_string().contains("invalid data source name 'missing'"));

        let err = parse(&f, json!({"collections": [12345]})).unwrap_err();
        assert!(err.is_bad_parameter());
        assert!(err.to_string().contains("only 0 out of 1"));
        assert!(err.to_string().contains("12345"));

        let err = parse(&f, json!({"collections": ["c1", "other"]})).unwrap_err();
        assert!(err.to_string().contains("only 1 out of 2"));

        let err = parse(&f, json!({"collections": "c1"})).unwrap_err();
        assert!(err.to_string().contains("null value or array"));
    }

    #[test]
    fn test_type_errors_name_the_option() {
        let f = fixture();
        for (options, needle) in [
            (json!({"waitForSync": 1}), "boolean value expected for option 'waitForSync'"),
            (json!({"countApproximate": "maybe"}), "unknown value 'maybe' for option 'countApproximate'"),
            (json!({"conditionOptimization": 3}), "string value expected for option 'conditionOptimization'"),
            (json!({"filterOptimization": "max"}), "int value expected for option 'filterOptimization'"),
            (json!({"parallelism": 0}), "positive value expected for option 'parallelism'"),
        ] {
            let err = parse(&f, options).unwrap_err();
            assert!(err.is_bad_parameter());
            assert!(err.to_string().contains(needle), "{} vs {}", err, needle);
        }
    }

    #[test]
    fn test_unknown_option_is_a_warning() {
        let f = fixture();
        let parsed = parse(&f, json!({"bogus": true, "waitForSync": true})).unwrap();
        assert!(parsed.force_sync);
        assert_eq!(f.ctx.warnings().len(), 1);
        assert!(f.ctx.warnings()[0].contains("bogus"));
    }

    #[test]
    fn test_non_constant_value_rejected() {
        let f = fixture();
        let mut arena = ExprArena::new();
        let var = arena.reference(tessera_core::VariableId(3));
        let obj = arena.add(Expr::Object(vec![("waitForSync".into(), var)]));
        let err = parse_options(&f.ctx, &f.view, &arena, Some(obj)).unwrap_err();
        assert!(err.to_string().contains("non-constant"));
    }

    #[test]
    fn test_json_omits_defaults() {
        let options = SearchOptions::default();
        assert_eq!(
            options.to_json(),
            json!({"waitForSync": false, "conditionOptimization": "auto", "collections": null})
        );
        let back = SearchOptions::from_json(&options.to_json()).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn test_json_keeps_non_defaults() {
        let mut options = SearchOptions {
            force_sync: true,
            restrict_sources: true,
            no_materialization: true,
            count_approximate: CountApproximate::Cost,
            condition_optimization: ConditionOptimization::None,
            filter_optimization: 0,
            parallelism: 2,
            ..SearchOptions::default()
        };
        options.sources.insert(DataSourceId(5));
        let back = SearchOptions::from_json(&options.to_json()).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn test_from_json_rejects_bad_shapes() {
        assert!(SearchOptions::from_json(&json!([])).is_err());
        assert!(SearchOptions::from_json(&json!({"collections": [0]})).is_err());
        assert!(SearchOptions::from_json(&json!({"waitForSync": "yes"})).is_err());
        assert!(SearchOptions::from_json(&json!({})).is_ok());
    }
}

//! Compiled search filters
//!
//! A search condition arrives as an expression tree over the view's output
//! variable (`d.a == 1 AND STARTS_WITH(d.b, "x")`). [`FilterCompiler`]
//! turns it into a [`Filter`]: leaves that map directly onto term
//! dictionary lookups, combined with AND/OR/NOT.
//!
//! Compilation happens in three steps:
//!
//! 1. translation, resolving every non-document operand through the
//!    variable bindings of the current row;
//! 2. normalization per [`ConditionOptimization`];
//! 3. optimization (range merging, term merging, constant folding) unless
//!    the optimization level is `0`.
//!
//! A compiled filter is evaluated per segment into a roaring bitmap of live
//! matching documents.

use roaring::RoaringBitmap;
use serde_json::Value;
use std::ops::Bound;
use tessera_core::meta::IDENTITY_ANALYZER;
use tessera_core::value::join_path;
use tessera_core::{CompareOp, Error, Expr, ExprArena, ExprId, FieldValue, Result, VariableId};
use tessera_storage::Segment;

/// Filter optimization level meaning "every optimization"
pub const FILTER_OPTIMIZATION_MAX: i64 = -1;
/// Filter optimization level meaning "compile as normalized"
pub const FILTER_OPTIMIZATION_NONE: i64 = 0;

/// Largest number of conjunctions DNF expansion may produce
const MAX_DNF_TERMS: usize = 64;

// ============================================================================
// ConditionOptimization
// ============================================================================

/// How the condition is normalized before compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConditionOptimization {
    /// Push negations inward, expand to DNF, flatten
    #[default]
    Auto,
    /// Push negations inward and flatten, no DNF expansion
    NoDnf,
    /// Expand to DNF but leave negations in place
    NoNegation,
    /// Compile as written
    None,
}

impl ConditionOptimization {
    /// Option value
    pub fn as_str(self) -> &'static str {
        match self {
            ConditionOptimization::Auto => "auto",
            ConditionOptimization::NoDnf => "nodnf",
            ConditionOptimization::NoNegation => "noneg",
            ConditionOptimization::None => "none",
        }
    }

    /// Parse an option value
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "auto" => ConditionOptimization::Auto,
            "nodnf" => ConditionOptimization::NoDnf,
            "noneg" => ConditionOptimization::NoNegation,
            "none" => ConditionOptimization::None,
            _ => return None,
        })
    }
}

// ============================================================================
// Filter
// ============================================================================

/// A compiled filter
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every live document
    All {
        /// Score multiplier
        boost: f32,
    },
    /// No document
    Empty,
    /// Field equals value
    Term {
        /// Dotted field path
        field: String,
        /// Exact value
        value: FieldValue,
        /// Score multiplier
        boost: f32,
    },
    /// Field equals any of the values
    Terms {
        /// Dotted field path
        field: String,
        /// Sorted, deduplicated values
        values: Vec<FieldValue>,
        /// Score multiplier
        boost: f32,
    },
    /// Field within bounds; only values of the bounds' type match
    Range {
        /// Dotted field path
        field: String,
        /// Lower bound
        lower: Bound<FieldValue>,
        /// Upper bound
        upper: Bound<FieldValue>,
        /// Score multiplier
        boost: f32,
    },
    /// String field starting with a prefix
    Prefix {
        /// Dotted field path
        field: String,
        /// Required prefix
        prefix: String,
        /// Score multiplier
        boost: f32,
    },
    /// Field (or any of its sub-fields) present
    Exists {
        /// Dotted field path
        field: String,
        /// Score multiplier
        boost: f32,
    },
    /// Conjunction; empty means [`Filter::All`]
    And(Vec<Filter>),
    /// Disjunction; empty means [`Filter::Empty`]
    Or(Vec<Filter>),
    /// Negation
    Not(Box<Filter>),
}

impl Filter {
    /// Unboosted match-all
    pub fn all() -> Filter {
        Filter::All { boost: 1.0 }
    }

    /// True for leaves (anything but AND/OR/NOT)
    pub fn is_leaf(&self) -> bool {
        !matches!(self, Filter::And(_) | Filter::Or(_) | Filter::Not(_))
    }

    fn with_boost(self, factor: f32) -> Filter {
        match self {
            Filter::All { boost } => Filter::All { boost: boost * factor },
            Filter::Term { field, value, boost } => Filter::Term {
                field,
                value,
                boost: boost * factor,
            },
            Filter::Terms { field, values, boost } => Filter::Terms {
                field,
                values,
                boost: boost * factor,
            },
            Filter::Range {
                field,
                lower,
                upper,
                boost,
            } => Filter::Range {
                field,
                lower,
                upper,
                boost: boost * factor,
            },
            Filter::Prefix { field, prefix, boost } => Filter::Prefix {
                field,
                prefix,
                boost: boost * factor,
            },
            Filter::Exists { field, boost } => Filter::Exists {
                field,
                boost: boost * factor,
            },
            Filter::And(parts) => Filter::And(parts.into_iter().map(|p| p.with_boost(factor)).collect()),
            Filter::Or(parts) => Filter::Or(parts.into_iter().map(|p| p.with_boost(factor)).collect()),
            Filter::Not(inner) => Filter::Not(Box::new(inner.with_boost(factor))),
            Filter::Empty => Filter::Empty,
        }
    }

    /// Boost of a leaf; 1.0 for combinators
    pub fn boost(&self) -> f32 {
        match self {
            Filter::All { boost }
            | Filter::Term { boost, .. }
            | Filter::Terms { boost, .. }
            | Filter::Range { boost, .. }
            | Filter::Prefix { boost, .. }
            | Filter::Exists { boost, .. } => *boost,
            _ => 1.0,
        }
    }

    /// Leaves that contribute to scoring: every positive (non-negated)
    /// leaf except match-all and match-none, in depth-first order
    pub fn scoring_leaves(&self) -> Vec<&Filter> {
        let mut out = Vec::new();
        self.collect_scoring_leaves(&mut out);
        out
    }

    fn collect_scoring_leaves<'a>(&'a self, out: &mut Vec<&'a Filter>) {
        match self {
            Filter::And(parts) | Filter::Or(parts) => {
                for p in parts {
                    p.collect_scoring_leaves(out);
                }
            }
            Filter::Not(_) | Filter::All { .. } | Filter::Empty => {}
            leaf => out.push(leaf),
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Live documents of `segment` matching the filter
    pub fn execute(&self, segment: &Segment) -> RoaringBitmap {
        let live = segment.live_docs();
        let mut hits = self.eval(segment, &live);
        hits &= &live;
        hits
    }

    fn eval(&self, seg: &Segment, live: &RoaringBitmap) -> RoaringBitmap {
        match self {
            Filter::All { .. } => live.clone(),
            Filter::Empty => RoaringBitmap::new(),
            Filter::Term { field, value, .. } => postings_bitmap(seg.postings(field, value)),
            Filter::Terms { field, values, .. } => {
                let mut out = RoaringBitmap::new();
                for v in values {
                    out.extend(seg.postings(field, v).iter().copied());
                }
                out
            }
            Filter::Range {
                field, lower, upper, ..
            } => {
                let ty = bound_value(lower).or_else(|| bound_value(upper)).cloned();
                let mut out = RoaringBitmap::new();
                for (term, docs) in seg.terms_in_range(field, (lower.clone(), upper.clone())) {
                    if ty.as_ref().map_or(true, |t| term.same_type(t)) {
                        out.extend(docs.iter().copied());
                    }
                }
                out
            }
            Filter::Prefix { field, prefix, .. } => {
                let start = Bound::Included(FieldValue::String(prefix.clone()));
                let mut out = RoaringBitmap::new();
                for (term, docs) in seg.terms_in_range(field, (start, Bound::Unbounded)) {
                    match term.as_str() {
                        Some(s) if s.starts_with(prefix.as_str()) => out.extend(docs.iter().copied()),
                        _ => break,
                    }
                }
                out
            }
            Filter::Exists { field, .. } => {
                let nested = format!("{}.", field);
                let mut out = RoaringBitmap::new();
                for (name, dict) in seg.fields() {
                    if name == field || name.starts_with(&nested) {
                        for docs in dict.values() {
                            out.extend(docs.iter().copied());
                        }
                    }
                }
                out
            }
            Filter::And(parts) => {
                let mut iter = parts.iter();
                let mut acc = match iter.next() {
                    Some(first) => first.eval(seg, live),
                    None => return live.clone(),
                };
                for p in iter {
                    if acc.is_empty() {
                        break;
                    }
                    acc &= p.eval(seg, live);
                }
                acc
            }
            Filter::Or(parts) => {
                let mut acc = RoaringBitmap::new();
                for p in parts {
                    acc |= p.eval(seg, live);
                }
                acc
            }
            Filter::Not(inner) => {
                let mut out = live.clone();
                out -= inner.eval(seg, live);
                out
            }
        }
    }

    /// Upper bound of the number of documents matching in `segment`,
    /// computed without evaluating the filter
    pub fn estimate(&self, seg: &Segment) -> u64 {
        let docs = seg.live_doc_count() as u64;
        let est = match self {
            Filter::All { .. } => docs,
            Filter::Empty => 0,
            Filter::Term { field, value, .. } => seg.postings(field, value).len() as u64,
            Filter::Terms { field, values, .. } => values
                .iter()
                .map(|v| seg.postings(field, v).len() as u64)
                .sum(),
            Filter::Range {
                field, lower, upper, ..
            } => seg
                .terms_in_range(field, (lower.clone(), upper.clone()))
                .map(|(_, d)| d.len() as u64)
                .sum(),
            Filter::Prefix { field, prefix, .. } => seg
                .terms_in_range(
                    field,
                    (Bound::Included(FieldValue::String(prefix.clone())), Bound::Unbounded),
                )
                .take_while(|(t, _)| t.as_str().map_or(false, |s| s.starts_with(prefix.as_str())))
                .map(|(_, d)| d.len() as u64)
                .sum(),
            Filter::Exists { .. } => docs,
            Filter::And(parts) => parts.iter().map(|p| p.estimate(seg)).min().unwrap_or(docs),
            Filter::Or(parts) => parts.iter().map(|p| p.estimate(seg)).sum(),
            Filter::Not(_) => docs,
        };
        est.min(docs)
    }
}

fn postings_bitmap(docs: &[u32]) -> RoaringBitmap {
    let mut out = RoaringBitmap::new();
    out.extend(docs.iter().copied());
    out
}

fn bound_value(b: &Bound<FieldValue>) -> Option<&FieldValue> {
    match b {
        Bound::Included(v) | Bound::Excluded(v) => Some(v),
        Bound::Unbounded => None,
    }
}

// ============================================================================
// Compilation
// ============================================================================

/// Translates condition expressions into [`Filter`]s
pub struct FilterCompiler<'a> {
    arena: &'a ExprArena,
    out_var: VariableId,
    bindings: &'a dyn Fn(VariableId) -> Option<Value>,
}

impl<'a> FilterCompiler<'a> {
    /// Compiler for conditions over `out_var`; other variables resolve
    /// through `bindings`
    pub fn new(
        arena: &'a ExprArena,
        out_var: VariableId,
        bindings: &'a dyn Fn(VariableId) -> Option<Value>,
    ) -> Self {
        FilterCompiler {
            arena,
            out_var,
            bindings,
        }
    }

    /// Compile, normalize and optimize the condition at `root`
    pub fn compile(&self, root: ExprId, mode: ConditionOptimization, level: i64) -> Result<Filter> {
        let raw = self.translate(root, 1.0)?;
        Ok(finish(raw, mode, level))
    }

    /// Compile the condition split at its top-level conjunction: the first
    /// `immutable` conjuncts are compiled one by one, the rest as one tail.
    pub fn compile_split(
        &self,
        root: ExprId,
        immutable: usize,
        mode: ConditionOptimization,
        level: i64,
    ) -> Result<(Vec<Filter>, Filter)> {
        match self.arena.get(root) {
            Expr::And(parts) if immutable > 0 => {
                let n = immutable.min(parts.len());
                let head = parts[..n]
                    .iter()
                    .map(|p| self.compile(*p, mode, level))
                    .collect::<Result<Vec<_>>>()?;
                let tail = parts[n..]
                    .iter()
                    .map(|p| self.translate(*p, 1.0))
                    .collect::<Result<Vec<_>>>()?;
                Ok((head, finish(Filter::And(tail), mode, level)))
            }
            _ => Ok((Vec::new(), self.compile(root, mode, level)?)),
        }
    }

    /// Compile the trailing conjuncts only (used when re-arming)
    pub fn compile_tail(
        &self,
        root: ExprId,
        immutable: usize,
        mode: ConditionOptimization,
        level: i64,
    ) -> Result<Filter> {
        match self.arena.get(root) {
            Expr::And(parts) if immutable > 0 => {
                let n = immutable.min(parts.len());
                let tail = parts[n..]
                    .iter()
                    .map(|p| self.translate(*p, 1.0))
                    .collect::<Result<Vec<_>>>()?;
                Ok(finish(Filter::And(tail), mode, level))
            }
            _ => self.compile(root, mode, level),
        }
    }

    fn translate(&self, id: ExprId, boost: f32) -> Result<Filter> {
        match self.arena.get(id) {
            Expr::MatchAll => Ok(Filter::All { boost }),
            Expr::And(parts) => Ok(Filter::And(
                parts
                    .iter()
                    .map(|p| self.translate(*p, boost))
                    .collect::<Result<_>>()?,
            )),
            Expr::Or(parts) => Ok(Filter::Or(
                parts
                    .iter()
                    .map(|p| self.translate(*p, boost))
                    .collect::<Result<_>>()?,
            )),
            Expr::Not(inner) => Ok(Filter::Not(Box::new(self.translate(*inner, boost)?))),
            Expr::Compare { op, lhs, rhs } => self.translate_compare(id, *op, *lhs, *rhs, boost),
            Expr::Call { name, args } => self.translate_call(id, name, args, boost),
            _ => {
                let v = self.value_of(id)?;
                Ok(if truthy(&v) { Filter::All { boost } } else { Filter::Empty })
            }
        }
    }

    fn translate_compare(&self, id: ExprId, op: CompareOp, lhs: ExprId, rhs: ExprId, boost: f32) -> Result<Filter> {
        if let Some(field) = self.field_of(lhs) {
            let value = self.value_of(rhs)?;
            return Ok(compare_filter(field, op, &value, boost));
        }
        if let Some(field) = self.field_of(rhs) {
            let value = self.value_of(lhs)?;
            return Ok(match op {
                // `v IN d.tags`: array members are indexed under the array path
                CompareOp::In => scalar_term(field, &value, boost),
                CompareOp::NotIn => Filter::Not(Box::new(scalar_term(field, &value, boost))),
                other => compare_filter(field, other.mirrored(), &value, boost),
            });
        }
        let l = self.value_of(lhs)?;
        let r = self.value_of(rhs)?;
        match constant_compare(op, &l, &r) {
            Some(true) => Ok(Filter::All { boost }),
            Some(false) => Ok(Filter::Empty),
            None => Err(self.unsupported(id)),
        }
    }

    fn translate_call(&self, id: ExprId, name: &str, args: &[ExprId], boost: f32) -> Result<Filter> {
        match (name, args) {
            ("EXISTS", [attr]) => {
                let field = self.field_of(*attr).ok_or_else(|| self.unsupported(id))?;
                Ok(Filter::Exists { field, boost })
            }
            ("STARTS_WITH", [attr, prefix]) => {
                let field = self.field_of(*attr).ok_or_else(|| self.unsupported(id))?;
                match self.value_of(*prefix)? {
                    Value::String(prefix) => Ok(Filter::Prefix { field, prefix, boost }),
                    _ => Err(Error::bad_parameter(format!(
                        "'STARTS_WITH' expects a string prefix in '{}'",
                        self.arena.render(id)
                    ))),
                }
            }
            ("IN_RANGE", [attr, low, high, incl_low, incl_high]) => {
                let field = self.field_of(*attr).ok_or_else(|| self.unsupported(id))?;
                let low = FieldValue::from_json(&self.value_of(*low)?);
                let high = FieldValue::from_json(&self.value_of(*high)?);
                let incl_low = self.bool_arg(id, *incl_low)?;
                let incl_high = self.bool_arg(id, *incl_high)?;
                match (low, high) {
                    (Some(low), Some(high)) if low.same_type(&high) => Ok(Filter::Range {
                        field,
                        lower: if incl_low { Bound::Included(low) } else { Bound::Excluded(low) },
                        upper: if incl_high { Bound::Included(high) } else { Bound::Excluded(high) },
                        boost,
                    }),
                    _ => Ok(Filter::Empty),
                }
            }
            ("BOOST", [inner, factor]) => {
                let factor = self
                    .value_of(*factor)?
                    .as_f64()
                    .ok_or_else(|| Error::bad_parameter(format!(
                        "'BOOST' expects a numeric factor in '{}'",
                        self.arena.render(id)
                    )))?;
                Ok(self.translate(*inner, boost)?.with_boost(factor as f32))
            }
            ("ANALYZER", [inner, analyzer]) => match self.value_of(*analyzer)? {
                Value::String(a) if a == IDENTITY_ANALYZER => self.translate(*inner, boost),
                Value::String(a) => Err(Error::unsupported_filter(format!(
                    "analyzer '{}' is not supported in '{}'",
                    a,
                    self.arena.render(id)
                ))),
                _ => Err(Error::bad_parameter(format!(
                    "'ANALYZER' expects an analyzer name in '{}'",
                    self.arena.render(id)
                ))),
            },
            _ => Err(self.unsupported(id)),
        }
    }

    fn bool_arg(&self, call: ExprId, arg: ExprId) -> Result<bool> {
        self.value_of(arg)?.as_bool().ok_or_else(|| {
            Error::bad_parameter(format!(
                "expected a boolean argument in '{}'",
                self.arena.render(call)
            ))
        })
    }

    fn field_of(&self, id: ExprId) -> Option<String> {
        match self.arena.attribute_access(id) {
            Some((var, path)) if var == self.out_var && !path.is_empty() => Some(join_path(&path)),
            _ => None,
        }
    }

    fn value_of(&self, id: ExprId) -> Result<Value> {
        if self.arena.variables_of(id).contains(&self.out_var) {
            return Err(self.unsupported(id));
        }
        self.arena
            .evaluate(id, self.bindings)
            .map_err(|_| self.unsupported(id))
    }

    fn unsupported(&self, id: ExprId) -> Error {
        Error::unsupported_filter(format!(
            "unsupported search condition '{}'",
            self.arena.render(id)
        ))
    }
}

fn finish(raw: Filter, mode: ConditionOptimization, level: i64) -> Filter {
    let normalized = normalize(raw, mode);
    if level == FILTER_OPTIMIZATION_NONE {
        normalized
    } else {
        optimize(normalized)
    }
}

fn scalar_term(field: String, value: &Value, boost: f32) -> Filter {
    match FieldValue::from_json(value) {
        Some(value) => Filter::Term { field, value, boost },
        None => Filter::Empty,
    }
}

fn compare_filter(field: String, op: CompareOp, value: &Value, boost: f32) -> Filter {
    let scalar = FieldValue::from_json(value);
    match (op, scalar) {
        (CompareOp::Eq, Some(value)) => Filter::Term { field, value, boost },
        (CompareOp::Eq, None) => Filter::Empty,
        (CompareOp::Ne, Some(value)) => Filter::Not(Box::new(Filter::Term { field, value, boost })),
        (CompareOp::Ne, None) => Filter::All { boost },
        (CompareOp::Lt, Some(v)) => range(field, Bound::Unbounded, Bound::Excluded(v), boost),
        (CompareOp::Le, Some(v)) => range(field, Bound::Unbounded, Bound::Included(v), boost),
        (CompareOp::Gt, Some(v)) => range(field, Bound::Excluded(v), Bound::Unbounded, boost),
        (CompareOp::Ge, Some(v)) => range(field, Bound::Included(v), Bound::Unbounded, boost),
        (CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge, None) => Filter::Empty,
        (CompareOp::In, _) => terms_of(field, value, boost),
        (CompareOp::NotIn, _) => match terms_of(field, value, boost) {
            Filter::Empty => Filter::All { boost },
            f => Filter::Not(Box::new(f)),
        },
    }
}

fn range(field: String, lower: Bound<FieldValue>, upper: Bound<FieldValue>, boost: f32) -> Filter {
    Filter::Range {
        field,
        lower,
        upper,
        boost,
    }
}

fn terms_of(field: String, value: &Value, boost: f32) -> Filter {
    let Some(items) = value.as_array() else {
        return Filter::Empty;
    };
    let mut values: Vec<FieldValue> = items.iter().filter_map(FieldValue::from_json).collect();
    values.sort();
    values.dedup();
    if values.is_empty() {
        Filter::Empty
    } else {
        Filter::Terms { field, values, boost }
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn constant_compare(op: CompareOp, l: &Value, r: &Value) -> Option<bool> {
    match op {
        CompareOp::In | CompareOp::NotIn => {
            let items = r.as_array()?;
            let found = items.iter().any(|i| i == l);
            Some(if op == CompareOp::In { found } else { !found })
        }
        _ => {
            let a = FieldValue::from_json(l)?;
            let b = FieldValue::from_json(r)?;
            Some(match op {
                CompareOp::Eq => a == b,
                CompareOp::Ne => a != b,
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
                CompareOp::In | CompareOp::NotIn => return None,
            })
        }
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Rewrite `filter` according to `mode`
pub fn normalize(filter: Filter, mode: ConditionOptimization) -> Filter {
    match mode {
        ConditionOptimization::Auto => flatten(dnf(nnf(filter))),
        ConditionOptimization::NoDnf => flatten(nnf(filter)),
        ConditionOptimization::NoNegation => flatten(dnf(filter)),
        ConditionOptimization::None => filter,
    }
}

/// Push negations down to the leaves
fn nnf(filter: Filter) -> Filter {
    match filter {
        Filter::Not(inner) => match *inner {
            Filter::Not(x) => nnf(*x),
            Filter::And(parts) => Filter::Or(parts.into_iter().map(|p| nnf(Filter::Not(Box::new(p)))).collect()),
            Filter::Or(parts) => Filter::And(parts.into_iter().map(|p| nnf(Filter::Not(Box::new(p)))).collect()),
            Filter::All { .. } => Filter::Empty,
            Filter::Empty => Filter::all(),
            leaf => Filter::Not(Box::new(leaf)),
        },
        Filter::And(parts) => Filter::And(parts.into_iter().map(nnf).collect()),
        Filter::Or(parts) => Filter::Or(parts.into_iter().map(nnf).collect()),
        leaf => leaf,
    }
}

/// Distribute AND over OR, unless that would exceed [`MAX_DNF_TERMS`]
fn dnf(filter: Filter) -> Filter {
    match filter {
        Filter::Or(parts) => Filter::Or(parts.into_iter().map(dnf).collect()),
        Filter::Not(inner) => Filter::Not(Box::new(dnf(*inner))),
        Filter::And(parts) => {
            let parts: Vec<Filter> = parts.into_iter().map(dnf).collect();
            let total = parts.iter().try_fold(1usize, |acc, p| {
                let n = match p {
                    Filter::Or(ds) => ds.len().max(1),
                    _ => 1,
                };
                acc.checked_mul(n).filter(|t| *t <= MAX_DNF_TERMS)
            });
            if total.is_none() || !parts.iter().any(|p| matches!(p, Filter::Or(_))) {
                return Filter::And(parts);
            }
            let mut rows: Vec<Vec<Filter>> = vec![Vec::new()];
            for part in parts {
                let options = match part {
                    Filter::Or(ds) if !ds.is_empty() => ds,
                    other => vec![other],
                };
                let mut next = Vec::with_capacity(rows.len() * options.len());
                for row in &rows {
                    for opt in &options {
                        let mut r = row.clone();
                        r.push(opt.clone());
                        next.push(r);
                    }
                }
                rows = next;
            }
            Filter::Or(rows.into_iter().map(Filter::And).collect())
        }
        leaf => leaf,
    }
}

/// Splice nested conjunctions/disjunctions into their parent
fn flatten(filter: Filter) -> Filter {
    match filter {
        Filter::And(parts) => {
            let mut out = Vec::with_capacity(parts.len());
            for p in parts.into_iter().map(flatten) {
                match p {
                    Filter::And(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            if out.len() == 1 {
                out.pop().unwrap_or_else(Filter::all)
            } else {
                Filter::And(out)
            }
        }
        Filter::Or(parts) => {
            let mut out = Vec::with_capacity(parts.len());
            for p in parts.into_iter().map(flatten) {
                match p {
                    Filter::Or(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            if out.len() == 1 {
                out.pop().unwrap_or(Filter::Empty)
            } else {
                Filter::Or(out)
            }
        }
        Filter::Not(inner) => Filter::Not(Box::new(flatten(*inner))),
        leaf => leaf,
    }
}

// ============================================================================
// Optimization
// ============================================================================

/// Fold constants, merge ranges and terms, drop duplicates
pub fn optimize(filter: Filter) -> Filter {
    match filter {
        Filter::And(parts) => {
            let mut out: Vec<Filter> = Vec::with_capacity(parts.len());
            for p in parts.into_iter().map(optimize) {
                match p {
                    Filter::All { .. } => {}
                    Filter::Empty => return Filter::Empty,
                    Filter::And(inner) => out.extend(inner),
                    Filter::Range {
                        field,
                        lower,
                        upper,
                        boost,
                    } => merge_range(&mut out, field, lower, upper, boost),
                    other => {
                        if !out.contains(&other) {
                            out.push(other);
                        }
                    }
                }
            }
            if out.iter().any(|f| matches!(f, Filter::Empty)) {
                return Filter::Empty;
            }
            match out.len() {
                0 => Filter::all(),
                1 => out.pop().unwrap_or_else(Filter::all),
                _ => Filter::And(out),
            }
        }
        Filter::Or(parts) => {
            let mut out: Vec<Filter> = Vec::with_capacity(parts.len());
            for p in parts.into_iter().map(optimize) {
                match p {
                    Filter::Empty => {}
                    Filter::All { .. } => return Filter::all(),
                    Filter::Or(inner) => out.extend(inner),
                    Filter::Term { field, value, boost } => merge_terms(&mut out, field, vec![value], boost),
                    Filter::Terms { field, values, boost } => merge_terms(&mut out, field, values, boost),
                    other => {
                        if !out.contains(&other) {
                            out.push(other);
                        }
                    }
                }
            }
            match out.len() {
                0 => Filter::Empty,
                1 => out.pop().unwrap_or(Filter::Empty),
                _ => Filter::Or(out),
            }
        }
        Filter::Not(inner) => match optimize(*inner) {
            Filter::All { .. } => Filter::Empty,
            Filter::Empty => Filter::all(),
            Filter::Not(x) => *x,
            other => Filter::Not(Box::new(other)),
        },
        Filter::Terms { field, values, boost } if values.len() == 1 => {
            let value = values.into_iter().next().unwrap_or(FieldValue::Null);
            Filter::Term { field, value, boost }
        }
        Filter::Terms { values, .. } if values.is_empty() => Filter::Empty,
        Filter::Range {
            field,
            lower,
            upper,
            boost,
        } => {
            if range_is_empty(&lower, &upper) {
                Filter::Empty
            } else {
                Filter::Range {
                    field,
                    lower,
                    upper,
                    boost,
                }
            }
        }
        leaf => leaf,
    }
}

fn merge_range(
    out: &mut Vec<Filter>,
    field: String,
    lower: Bound<FieldValue>,
    upper: Bound<FieldValue>,
    boost: f32,
) {
    let ty = bound_value(&lower).or_else(|| bound_value(&upper)).cloned();
    for existing in out.iter_mut() {
        if let Filter::Range {
            field: f,
            lower: l,
            upper: u,
            boost: b,
        } = existing
        {
            let ety = bound_value(l).or_else(|| bound_value(u));
            let same_type = match (&ty, ety) {
                (Some(a), Some(b)) => a.same_type(b),
                _ => false,
            };
            if *f == field && *b == boost && same_type {
                *l = tighter(l.clone(), lower, true);
                *u = tighter(u.clone(), upper, false);
                if range_is_empty(l, u) {
                    *existing = Filter::Empty;
                }
                return;
            }
        }
    }
    out.push(Filter::Range {
        field,
        lower,
        upper,
        boost,
    });
}

fn tighter(a: Bound<FieldValue>, b: Bound<FieldValue>, lower: bool) -> Bound<FieldValue> {
    match (&a, &b) {
        (Bound::Unbounded, _) => b,
        (_, Bound::Unbounded) => a,
        _ => {
            let (va, vb) = match (bound_value(&a), bound_value(&b)) {
                (Some(x), Some(y)) => (x, y),
                _ => return a,
            };
            match va.cmp(vb) {
                std::cmp::Ordering::Equal => {
                    if matches!(a, Bound::Excluded(_)) {
                        a
                    } else {
                        b
                    }
                }
                std::cmp::Ordering::Less => {
                    if lower {
                        b
                    } else {
                        a
                    }
                }
                std::cmp::Ordering::Greater => {
                    if lower {
                        a
                    } else {
                        b
                    }
                }
            }
        }
    }
}

fn range_is_empty(lower: &Bound<FieldValue>, upper: &Bound<FieldValue>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u)) | (Bound::Excluded(l), Bound::Included(u)) => {
            l >= u
        }
        _ => false,
    }
}

fn merge_terms(out: &mut Vec<Filter>, field: String, values: Vec<FieldValue>, boost: f32) {
    for existing in out.iter_mut() {
        match existing {
            Filter::Terms {
                field: f,
                values: vs,
                boost: b,
            } if *f == field && *b == boost => {
                vs.extend(values);
                vs.sort();
                vs.dedup();
                return;
            }
            Filter::Term {
                field: f,
                value: v,
                boost: b,
            } if *f == field && *b == boost => {
                let mut vs = values;
                vs.push(v.clone());
                vs.sort();
                vs.dedup();
                *existing = if vs.len() == 1 {
                    Filter::Term {
                        field,
                        value: vs.remove(0),
                        boost,
                    }
                } else {
                    Filter::Terms {
                        field,
                        values: vs,
                        boost,
                    }
                };
                return;
            }
            _ => {}
        }
    }
    if values.len() == 1 {
        let mut values = values;
        out.push(Filter::Term {
            field,
            value: values.remove(0),
            boost,
        });
    } else {
        out.push(Filter::Terms { field, values, boost });
    }
}

//! Relevance scoring
//!
//! This module provides:
//! - Scorer trait for pluggable scoring algorithms
//! - ScorerContext for snapshot-wide statistics
//! - Bm25Scorer and TfIdfScorer, the two functions a query may call
//!
//! Statistics are gathered over the whole view snapshot, per scoring leaf of
//! the compiled filter (see [`Filter::scoring_leaves`]). A term occurs at most
//! once per field and document, so term frequency is always 1 and document
//! length is the segment norm (number of indexed terms).

use crate::filter::Filter;
use crate::view_snapshot::ViewSnapshot;
use serde_json::Value;
use tessera_core::{Error, Expr, ExprArena, ExprId, Result, VariableId};

/// BM25 term saturation default
pub const BM25_DEFAULT_K: f32 = 1.2;
/// BM25 length normalization default
pub const BM25_DEFAULT_B: f32 = 0.75;

// ============================================================================
// ScorerContext
// ============================================================================

/// Snapshot-wide statistics for scoring
#[derive(Debug, Clone, Default)]
pub struct ScorerContext {
    /// Live documents in the snapshot
    pub total_docs: u64,
    /// Matching live documents per scoring leaf
    pub doc_freqs: Vec<u64>,
    /// Boost per scoring leaf
    pub boosts: Vec<f32>,
    /// Average norm over live documents
    pub avg_doc_len: f32,
}

impl ScorerContext {
    /// Collect statistics for `leaves` over `snapshot`
    pub fn build(snapshot: &ViewSnapshot, leaves: &[&Filter]) -> Self {
        let mut doc_freqs = vec![0u64; leaves.len()];
        let mut total_len = 0u64;
        for seg in snapshot.segments() {
            for (i, leaf) in leaves.iter().enumerate() {
                doc_freqs[i] += leaf.execute(seg).len();
            }
            total_len += seg.live_docs().iter().map(|d| seg.norm(d) as u64).sum::<u64>();
        }
        let total_docs = snapshot.live_docs_count();
        ScorerContext {
            total_docs,
            doc_freqs,
            boosts: leaves.iter().map(|l| l.boost()).collect(),
            avg_doc_len: if total_docs == 0 {
                0.0
            } else {
                total_len as f32 / total_docs as f32
            },
        }
    }

    /// Compute IDF for a leaf
    ///
    /// IDF(t) = ln((N - df + 0.5) / (df + 0.5) + 1)
    pub fn idf(&self, leaf: usize) -> f32 {
        let df = self.doc_freqs.get(leaf).copied().unwrap_or(0) as f32;
        let n = self.total_docs as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn boost(&self, leaf: usize) -> f32 {
        self.boosts.get(leaf).copied().unwrap_or(1.0)
    }
}

/// Per-document input of a scorer
#[derive(Debug, Clone, Copy)]
pub struct DocStats<'a> {
    /// Number of indexed terms in the document
    pub norm: u32,
    /// Scoring leaves the document matched
    pub matched: &'a [usize],
}

// ============================================================================
// Scorer Trait
// ============================================================================

/// Pluggable scoring interface
///
/// Higher scores indicate more relevant documents. Scorers must be
/// Send + Sync since segments may be scored on a thread pool.
pub trait Scorer: std::fmt::Debug + Send + Sync {
    /// Score one document
    fn score(&self, doc: &DocStats<'_>, ctx: &ScorerContext) -> f32;

    /// Function name, as written in queries
    fn name(&self) -> &str;
}

// ============================================================================
// BM25
// ============================================================================

/// Okapi BM25 with term frequency fixed at 1
///
/// score += boost * IDF(t) * (k + 1) / (1 + k * (1 - b + b * dl / avgdl))
#[derive(Debug, Clone)]
pub struct Bm25Scorer {
    /// Term saturation
    pub k: f32,
    /// Length normalization
    pub b: f32,
}

impl Default for Bm25Scorer {
    fn default() -> Self {
        Bm25Scorer {
            k: BM25_DEFAULT_K,
            b: BM25_DEFAULT_B,
        }
    }
}

impl Scorer for Bm25Scorer {
    fn score(&self, doc: &DocStats<'_>, ctx: &ScorerContext) -> f32 {
        let len_norm = if ctx.avg_doc_len > 0.0 {
            1.0 - self.b + self.b * doc.norm as f32 / ctx.avg_doc_len
        } else {
            1.0
        };
        let tf_part = (self.k + 1.0) / (1.0 + self.k * len_norm);
        doc.matched
            .iter()
            .map(|&leaf| ctx.boost(leaf) * ctx.idf(leaf) * tf_part)
            .sum()
    }

    fn name(&self) -> &str {
        "BM25"
    }
}

// ============================================================================
// TF-IDF
// ============================================================================

/// Classic TF-IDF, optionally divided by the square root of the norm
#[derive(Debug, Clone, Default)]
pub struct TfIdfScorer {
    /// Apply length normalization
    pub with_norms: bool,
}

impl Scorer for TfIdfScorer {
    fn score(&self, doc: &DocStats<'_>, ctx: &ScorerContext) -> f32 {
        let n = ctx.total_docs as f32;
        let norm = if self.with_norms && doc.norm > 0 {
            1.0 / (doc.norm as f32).sqrt()
        } else {
            1.0
        };
        doc.matched
            .iter()
            .map(|&leaf| {
                let df = ctx.doc_freqs.get(leaf).copied().unwrap_or(0) as f32;
                ctx.boost(leaf) * (1.0 + (n / (df + 1.0)).ln()) * norm
            })
            .sum()
    }

    fn name(&self) -> &str {
        "TFIDF"
    }
}

// ============================================================================
// Compilation
// ============================================================================

/// Build a scorer from a call expression such as `BM25(d, 1.2, 0.75)`.
///
/// The first argument must be the view's output variable; the remaining
/// ones must be constants.
pub fn compile_scorer(arena: &ExprArena, id: ExprId, out_var: VariableId) -> Result<Box<dyn Scorer>> {
    let (name, args) = match arena.get(id) {
        Expr::Call { name, args } => (name.as_str(), args.as_slice()),
        _ => {
            return Err(Error::bad_parameter(format!(
                "scorer '{}' must be a function call",
                arena.render(id)
            )))
        }
    };
    match args.first().map(|a| arena.get(*a)) {
        Some(Expr::Reference(v)) if *v == out_var => {}
        _ => {
            return Err(Error::bad_parameter(format!(
                "first argument of scorer '{}' must be the view variable",
                arena.render(id)
            )))
        }
    }
    let consts = args[1..]
        .iter()
        .map(|a| arena.evaluate_constant(*a))
        .collect::<Result<Vec<Value>>>()
        .map_err(|_| {
            Error::bad_parameter(format!(
                "arguments of scorer '{}' must be constant",
                arena.render(id)
            ))
        })?;
    let number = |i: usize, default: f32| -> Result<f32> {
        match consts.get(i) {
            None => Ok(default),
            Some(v) => v.as_f64().map(|f| f as f32).ok_or_else(|| {
                Error::bad_parameter(format!(
                    "argument {} of scorer '{}' must be a number",
                    i + 2,
                    arena.render(id)
                ))
            }),
        }
    };
    match name {
        "BM25" if consts.len() <= 2 => Ok(Box::new(Bm25Scorer {
            k: number(0, BM25_DEFAULT_K)?,
            b: number(1, BM25_DEFAULT_B)?,
        })),
        "TFIDF" if consts.len() <= 1 => {
            let with_norms = match consts.first() {
                None => false,
                Some(Value::Bool(b)) => *b,
                Some(_) => {
                    return Err(Error::bad_parameter(format!(
                        "argument 2 of scorer '{}' must be a boolean",
                        arena.render(id)
                    )))
                }
            };
            Ok(Box::new(TfIdfScorer { with_norms }))
        }
        _ => Err(Error::bad_parameter(format!(
            "unsupported scorer '{}'",
            arena.render(id)
        ))),
    }
}

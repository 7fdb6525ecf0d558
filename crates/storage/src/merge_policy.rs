//! Consolidation candidate selection
//!
//! Given the segments of the last published snapshot, pick the set that one
//! consolidation run should merge. Two policies are supported:
//!
//! - **tier**: sort by (floored) live size and pick the best-scoring window
//!   of `segments_min..=segments_max` neighbours whose total stays below
//!   `segments_bytes_max`. Windows made of similarly sized segments score
//!   higher.
//! - **bytes_accum**: take the smallest segments while their accumulated
//!   size stays below `threshold` of the total.
//!
//! A single segment is only ever selected when it carries deletions, since
//! rewriting it then reclaims space.

use crate::segment::Segment;
use tessera_core::{ConsolidationPolicy, TierPolicy};

/// Pick segments to merge. An empty result means "nothing to do".
pub fn select_candidates(policy: &ConsolidationPolicy, segments: &[Segment]) -> Vec<Segment> {
    let selected = match policy {
        ConsolidationPolicy::Tier(tier) => select_tier(tier, segments),
        ConsolidationPolicy::BytesAccum { threshold } => select_bytes_accum(*threshold, segments),
    };
    match selected.as_slice() {
        [] => Vec::new(),
        [single] if single.deleted().is_empty() => Vec::new(),
        _ => selected,
    }
}

fn select_bytes_accum(threshold: f64, segments: &[Segment]) -> Vec<Segment> {
    let total: u64 = segments.iter().map(Segment::live_size_bytes).sum();
    if total == 0 {
        return Vec::new();
    }
    let budget = threshold * total as f64;
    let mut sorted: Vec<&Segment> = segments.iter().collect();
    sorted.sort_by_key(|s| s.live_size_bytes());

    let mut selected = Vec::new();
    let mut accumulated = 0u64;
    for seg in sorted {
        let size = seg.live_size_bytes();
        if (accumulated + size) as f64 > budget {
            break;
        }
        accumulated += size;
        selected.push(seg.clone());
    }
    selected
}

fn select_tier(policy: &TierPolicy, segments: &[Segment]) -> Vec<Segment> {
    let floor = policy.segments_bytes_floor.max(1);
    let mut sorted: Vec<(&Segment, u64)> = segments
        .iter()
        .map(|s| (s, s.live_size_bytes().max(floor)))
        .filter(|(_, size)| *size <= policy.segments_bytes_max)
        .collect();
    sorted.sort_by_key(|(_, size)| *size);

    let min = policy.segments_min.max(1);
    let max = policy.segments_max.max(min);
    let mut best: Option<(f64, usize, usize)> = None;

    for start in 0..sorted.len() {
        let mut total = 0u64;
        for end in start..sorted.len().min(start + max) {
            total += sorted[end].1;
            if total > policy.segments_bytes_max {
                break;
            }
            let count = end - start + 1;
            if count < min {
                continue;
            }
            // Similar sizes score higher; more segments per merge score higher
            let skew = sorted[end].1 as f64 / total as f64;
            let score = (1.0 - skew) * count as f64 + deletion_bonus(&sorted[start..=end]);
            if score < policy.min_score {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_score, bs, be)) => {
                    score > best_score || (score == best_score && count > be - bs + 1)
                }
            };
            if better {
                best = Some((score, start, end));
            }
        }
    }

    match best {
        Some((_, start, end)) => sorted[start..=end].iter().map(|(s, _)| (*s).clone()).collect(),
        None => Vec::new(),
    }
}

fn deletion_bonus(window: &[(&Segment, u64)]) -> f64 {
    let docs: u64 = window.iter().map(|(s, _)| s.doc_count() as u64).sum();
    if docs == 0 {
        return 0.0;
    }
    let deleted: u64 = window.iter().map(|(s, _)| s.deleted().len()).sum();
    deleted as f64 / docs as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentBuilder;
    use roaring::RoaringBitmap;
    use serde_json::json;
    use std::sync::Arc;
    use tessera_core::{IndexMeta, LocalDocumentId};

    fn segment(id: u64, docs: u64) -> Segment {
        let mut b = SegmentBuilder::new(Arc::new(IndexMeta::default()));
        for pk in 0..docs {
            b.add(LocalDocumentId(id * 1000 + pk), &json!({"value": pk}));
        }
        Segment::new(Arc::new(b.build(id)))
    }

    #[test]
    fn test_tier_merges_small_segments() {
        let segments: Vec<_> = (1..=4).map(|i| segment(i, 5)).collect();
        let policy = ConsolidationPolicy::Tier(TierPolicy::default());
        let picked = select_candidates(&policy, &segments);
        assert_eq!(picked.len(), 4);
    }

    #[test]
    fn test_tier_respects_segments_max() {
        let segments: Vec<_> = (1..=6).map(|i| segment(i, 5)).collect();
        let policy = ConsolidationPolicy::Tier(TierPolicy {
            segments_max: 3,
            ..TierPolicy::default()
        });
        assert_eq!(select_candidates(&policy, &segments).len(), 3);
    }

    #[test]
    fn test_single_clean_segment_is_not_rewritten() {
        let segments = vec![segment(1, 10)];
        let policy = ConsolidationPolicy::Tier(TierPolicy::default());
        assert!(select_candidates(&policy, &segments).is_empty());
    }

    #[test]
    fn test_single_segment_with_deletions_is_rewritten() {
        let mut mask = RoaringBitmap::new();
        mask.insert(0);
        let segments = vec![segment(1, 10).with_deletions(mask)];
        let policy = ConsolidationPolicy::Tier(TierPolicy::default());
        assert_eq!(select_candidates(&policy, &segments).len(), 1);
    }

    #[test]
    fn test_bytes_accum_takes_smallest_under_threshold() {
        let segments = vec![segment(1, 100), segment(2, 2), segment(3, 3)];
        let policy = ConsolidationPolicy::BytesAccum { threshold: 0.2 };
        let picked = select_candidates(&policy, &segments);
        let ids: Vec<_> = picked.iter().map(Segment::id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn test_bytes_accum_zero_threshold_selects_nothing() {
        let segments = vec![segment(1, 4), segment(2, 4)];
        let policy = ConsolidationPolicy::BytesAccum { threshold: 0.0 };
        assert!(select_candidates(&policy, &segments).is_empty());
    }
}

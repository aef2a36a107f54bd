//! Reciprocal Rank Fusion.
//!
//! Each candidate contributes `1 / (k + rank)` per leg it appears in, with
//! 1-based ranks. Scores from different legs are never compared directly.

use std::cmp::Ordering;
use std::collections::HashMap;

use kbase_core::EntryKey;

use crate::types::{FusedResult, Leg, SearchCandidate};

struct Accumulator {
    result: FusedResult,
    best_rank: usize,
}

/// Fuse two ranked lists into one, sorted best first.
///
/// Order: fused score descending, then entries present in both legs, then
/// the better (lower) individual rank, then key ascending. Title and snippet
/// come from the keyword leg when it has the entry, since its snippet is
/// centred on a match.
pub fn rrf_fuse(
    keyword: &[SearchCandidate],
    semantic: &[SearchCandidate],
    k: f64,
) -> Vec<FusedResult> {
    let mut by_key: HashMap<EntryKey, Accumulator> = HashMap::new();

    for (leg, candidates) in [(Leg::Keyword, keyword), (Leg::Semantic, semantic)] {
        for candidate in candidates {
            let contribution = 1.0 / (k + candidate.rank as f64);
            match by_key.get_mut(&candidate.key) {
                Some(acc) => {
                    acc.result.score += contribution;
                    acc.result.source_legs.insert(leg);
                    acc.best_rank = acc.best_rank.min(candidate.rank);
                }
                None => {
                    let mut result = FusedResult::from_candidate(candidate.clone(), leg);
                    result.score = contribution;
                    by_key.insert(
                        candidate.key.clone(),
                        Accumulator {
                            result,
                            best_rank: candidate.rank,
                        },
                    );
                }
            }
        }
    }

    let mut fused: Vec<Accumulator> = by_key.into_values().collect();
    fused.sort_by(compare);
    fused.into_iter().map(|acc| acc.result).collect()
}

fn compare(a: &Accumulator, b: &Accumulator) -> Ordering {
    b.result
        .score
        .partial_cmp(&a.result.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.result.source_legs.len().cmp(&a.result.source_legs.len()))
        .then_with(|| a.best_rank.cmp(&b.best_rank))
        .then_with(|| a.result.key.cmp(&b.result.key))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn cand(id: &str, rank: usize) -> SearchCandidate {
        SearchCandidate {
            key: EntryKey::new(id, "docs"),
            title: format!("title {id}"),
            snippet: String::new(),
            raw_score: 0.0,
            rank,
        }
    }

    fn ids(results: &[FusedResult]) -> Vec<&str> {
        results.iter().map(|r| r.key.entry_id.as_str()).collect()
    }

    #[test]
    fn test_worked_example() {
        let keyword = vec![cand("A", 1), cand("B", 2)];
        let semantic = vec![cand("C", 1), cand("D", 2), cand("A", 3)];
        let fused = rrf_fuse(&keyword, &semantic, 60.0);

        assert_eq!(fused[0].key.entry_id, "A");
        let expected_a = 1.0 / 61.0 + 1.0 / 63.0;
        assert!((fused[0].score - expected_a).abs() < 1e-12);
        assert_eq!(fused[0].source_legs, BTreeSet::from([Leg::Keyword, Leg::Semantic]));

        let b = fused.iter().find(|r| r.key.entry_id == "B").unwrap();
        assert!((b.score - 1.0 / 62.0).abs() < 1e-12);
        assert_eq!(b.source_legs, BTreeSet::from([Leg::Keyword]));

        // C (1/61) beats B and D (1/62); B and D tie on score and rank, key decides.
        assert_eq!(ids(&fused), vec!["A", "C", "B", "D"]);
    }

    #[test]
    fn test_deterministic_regardless_of_input_order() {
        let keyword = vec![cand("x", 1), cand("y", 2), cand("z", 3)];
        let semantic = vec![cand("z", 1), cand("w", 2), cand("x", 3)];
        let first = rrf_fuse(&keyword, &semantic, 60.0);
        for _ in 0..20 {
            assert_eq!(ids(&rrf_fuse(&keyword, &semantic, 60.0)), ids(&first));
        }
    }

    #[test]
    fn test_both_legs_wins_score_tie() {
        // With k = 0: "both" scores 1/2 + 1/2 = 1.0, "solo" scores 1/1 = 1.0.
        let keyword = vec![cand("solo", 1), cand("both", 2)];
        let semantic = vec![cand("both", 2)];
        let fused = rrf_fuse(&keyword, &semantic, 0.0);
        assert_eq!(ids(&fused), vec!["both", "solo"]);
    }

    #[test]
    fn test_keyword_title_preferred() {
        let mut kw = cand("a", 1);
        kw.snippet = "keyword snippet".into();
        let mut sem = cand("a", 1);
        sem.snippet = "semantic snippet".into();
        let fused = rrf_fuse(&[kw], &[sem], 60.0);
        assert_eq!(fused[0].snippet, "keyword snippet");
    }

    #[test]
    fn test_empty_legs() {
        assert!(rrf_fuse(&[], &[], 60.0).is_empty());
        let only = rrf_fuse(&[], &[cand("s", 1)], 60.0);
        assert_eq!(only[0].source_legs, BTreeSet::from([Leg::Semantic]));
    }
}

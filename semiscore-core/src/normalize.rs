//! Turns raw top-N log densities into negated 8-bit scores relative to
//! their log-sum, clamped to `[0, MAX_NEG_ASCR]`.

use crate::logmath::{LogMath, MAX_NEG_ASCR, SENSCR_SHIFT};
use crate::topn::TopNEntry;

/// Normalize one stream's list in place. `lmath_8b` must be the
/// `SENSCR_SHIFT` domain.
pub fn normalize_topn(list: &mut [TopNEntry], lmath_8b: &LogMath) {
    let Some((first, rest)) = list.split_first() else {
        return;
    };
    let norm = rest.iter().fold(first.score >> SENSCR_SHIFT, |norm, e| {
        lmath_8b.add(norm, e.score >> SENSCR_SHIFT)
    });

    for e in list.iter_mut() {
        let s = norm.saturating_sub(e.score >> SENSCR_SHIFT);
        e.score = if (0..=MAX_NEG_ASCR).contains(&s) {
            s
        } else {
            MAX_NEG_ASCR
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logmath::DEFAULT_LOG_BASE;

    fn lmath_8b() -> LogMath {
        LogMath::new(DEFAULT_LOG_BASE, SENSCR_SHIFT, true).unwrap()
    }

    fn entries(scores: &[i32]) -> Vec<TopNEntry> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &score)| TopNEntry {
                codeword: i as u32,
                score,
            })
            .collect()
    }

    #[test]
    fn equal_scores_share_log_two() {
        let mut list = entries(&[-40 << SENSCR_SHIFT, -40 << SENSCR_SHIFT]);
        normalize_topn(&mut list, &lmath_8b());
        assert_eq!(list[0].score, 7);
        assert_eq!(list[1].score, 7);
    }

    #[test]
    fn single_entry_normalizes_to_zero() {
        let mut list = entries(&[-123_456]);
        normalize_topn(&mut list, &lmath_8b());
        assert_eq!(list[0].score, 0);
    }

    #[test]
    fn far_entries_clamp_to_max() {
        let mut list = entries(&[-1000, -500_000]);
        normalize_topn(&mut list, &lmath_8b());
        assert_eq!(list[0].score, 0);
        assert_eq!(list[1].score, MAX_NEG_ASCR);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn scores_within_bounds(raw in proptest::collection::vec(-2_000_000i32..0, 1..8)) {
                let mut raw = raw;
                raw.sort_unstable_by(|a, b| b.cmp(a));
                let mut list = entries(&raw);
                normalize_topn(&mut list, &lmath_8b());
                for e in &list {
                    prop_assert!((0..=MAX_NEG_ASCR).contains(&e.score));
                }
            }
        }
    }
}

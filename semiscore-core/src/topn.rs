//! Top-N codeword search.
//!
//! Per stream and frame:
//!
//! ```text
//! seed    cur <- prev, rescore every entry, insertion sort
//! skip    frame % ds_ratio != 0  -> done (prev is left as is)
//! scan    whole codebook, or k-d tree candidates, early exit on the
//!         running distance, skip codewords already listed, insert
//! commit  prev <- cur
//! ```
//!
//! Lists are sorted best-first (descending log density) and hold distinct
//! codewords. On equal scores, a codeword found by the scan goes ahead of
//! the one already listed.

use crate::codebook::Codebook;
use crate::fixpoint::{at_least, gmm_sub, mul, sub, to_score, weigh, Mean};
use crate::kdtree::CandidateOracle;

/// Score of an unevaluated placeholder entry.
pub const WORST_SCORE: i32 = i32::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopNEntry {
    pub codeword: u32,
    pub score: i32,
}

/// What the search did for one stream in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    SeedOnly,
    Full,
    Pruned { candidates: usize },
}

/// One stream's observation in both representations: codebook precision
/// for scoring, floats for k-d tree descent.
#[derive(Clone, Copy)]
pub struct Observation<'a> {
    pub fixed: &'a [Mean],
    pub raw: &'a [f32],
}

/// k-d tree pruning parameters for [`StreamTopN::evaluate`].
#[derive(Clone, Copy)]
pub struct Pruning<'a> {
    pub oracle: &'a dyn CandidateOracle,
    pub max_depth: usize,
    /// `None` means every candidate of the reached node.
    pub max_bbi: Option<usize>,
}

/// Log density of codeword `cw`, evaluated over every dimension.
#[inline]
pub fn codeword_score(cb: &Codebook, cw: usize, obs: &[Mean]) -> i32 {
    let mut d = cb.det(cw);
    for ((&x, &m), &v) in obs.iter().zip(cb.mean(cw)).zip(cb.precision(cw)) {
        let diff = sub(x, m);
        d = gmm_sub(d, weigh(mul(diff, diff), v));
    }
    to_score(d)
}

/// As [`codeword_score`] but gives up once the running value drops below
/// `worst`.
#[inline]
fn bounded_score(cb: &Codebook, cw: usize, obs: &[Mean], worst: i32) -> Option<i32> {
    let mut d = cb.det(cw);
    for ((&x, &m), &v) in obs.iter().zip(cb.mean(cw)).zip(cb.precision(cw)) {
        if !at_least(d, worst) {
            return None;
        }
        let diff = sub(x, m);
        d = gmm_sub(d, weigh(mul(diff, diff), v));
    }
    let score = to_score(d);
    (score >= worst).then_some(score)
}

/// Insert into a full sorted list, evicting the last entry.
#[inline]
fn insert(list: &mut [TopNEntry], codeword: u32, score: i32) {
    let Some(mut i) = list.len().checked_sub(1) else {
        return;
    };
    while i > 0 && score >= list[i - 1].score {
        list[i] = list[i - 1];
        i -= 1;
    }
    list[i] = TopNEntry { codeword, score };
}

#[inline]
fn consider(list: &mut [TopNEntry], cb: &Codebook, obs: &[Mean], cw: u32) {
    let Some(worst) = list.last().map(|e| e.score) else {
        return;
    };
    let Some(score) = bounded_score(cb, cw as usize, obs, worst) else {
        return;
    };
    if list.iter().any(|e| e.codeword == cw) {
        return;
    }
    insert(list, cw, score);
}

/// Current and previous-frame lists for one stream.
#[derive(Debug, Clone)]
pub struct StreamTopN {
    cur: Vec<TopNEntry>,
    prev: Vec<TopNEntry>,
}

impl StreamTopN {
    /// Placeholders `(j, WORST_SCORE)` for `j in 0..topn`.
    pub fn new(topn: usize) -> Self {
        let prev: Vec<TopNEntry> = (0..topn as u32)
            .map(|codeword| TopNEntry {
                codeword,
                score: WORST_SCORE,
            })
            .collect();
        Self {
            cur: prev.clone(),
            prev,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.prev.len());
    }

    pub fn current(&self) -> &[TopNEntry] {
        &self.cur
    }

    pub fn current_mut(&mut self) -> &mut [TopNEntry] {
        &mut self.cur
    }

    pub fn previous(&self) -> &[TopNEntry] {
        &self.prev
    }

    /// Rescore the previous frame's codewords and sort.
    pub fn seed(&mut self, cb: &Codebook, obs: &[Mean]) {
        self.cur.copy_from_slice(&self.prev);
        for i in 0..self.cur.len() {
            let e = self.cur[i];
            let score = codeword_score(cb, e.codeword as usize, obs);
            let mut j = i;
            while j > 0 && score > self.cur[j - 1].score {
                self.cur[j] = self.cur[j - 1];
                j -= 1;
            }
            self.cur[j] = TopNEntry {
                codeword: e.codeword,
                score,
            };
        }
    }

    pub fn scan_all(&mut self, cb: &Codebook, obs: &[Mean]) {
        for cw in 0..cb.n_density() as u32 {
            consider(&mut self.cur, cb, obs, cw);
        }
    }

    /// Candidates outside the codebook are skipped.
    pub fn scan_candidates(&mut self, cb: &Codebook, obs: &[Mean], candidates: &[u32]) {
        for &cw in candidates.iter().filter(|&&cw| (cw as usize) < cb.n_density()) {
            consider(&mut self.cur, cb, obs, cw);
        }
    }

    pub fn commit(&mut self) {
        self.prev.copy_from_slice(&self.cur);
    }

    /// One frame of search for stream `stream`.
    pub fn evaluate(
        &mut self,
        stream: usize,
        frame: u32,
        ds_ratio: u32,
        cb: &Codebook,
        obs: Observation<'_>,
        pruning: Option<Pruning<'_>>,
    ) -> SearchKind {
        let Observation { fixed: obs, raw } = obs;
        self.seed(cb, obs);
        if frame % ds_ratio.max(1) != 0 {
            return SearchKind::SeedOnly;
        }
        let kind = match pruning {
            Some(p) => {
                let node = p.oracle.candidates(stream, raw, p.max_depth);
                let n = p.max_bbi.map_or(node.len(), |m| m.min(node.len()));
                self.scan_candidates(cb, obs, &node[..n]);
                SearchKind::Pruned { candidates: n }
            }
            None => {
                self.scan_all(cb, obs);
                SearchKind::Full
            }
        };
        self.commit();
        kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codebook::{CodebookSet, GaussianFile};
    use crate::fixpoint::observation_into;
    use crate::kdtree::{KdTree, KdTreeSet};
    use crate::logmath::{LogMath, DEFAULT_LOG_BASE};

    /// One stream, 1-D codewords at the given means, unit variance.
    fn codebook(means: &[f32]) -> CodebookSet {
        let n = means.len();
        let m = GaussianFile {
            n_density: n,
            veclen: vec![1],
            streams: vec![means.to_vec()],
        };
        let v = GaussianFile {
            n_density: n,
            veclen: vec![1],
            streams: vec![vec![1.0; n]],
        };
        let lmath = LogMath::new(DEFAULT_LOG_BASE, 0, false).unwrap();
        CodebookSet::from_files(&m, &v, 0.0001, &lmath).unwrap()
    }

    fn obs(x: f32) -> Vec<Mean> {
        let mut out = Vec::new();
        observation_into(&[x], &mut out);
        out
    }

    fn codewords(s: &StreamTopN) -> Vec<u32> {
        s.current().iter().map(|e| e.codeword).collect()
    }

    #[test]
    fn full_scan_finds_nearest_codewords() {
        let cb = codebook(&[0.0, 10.0, 2.0, 5.0, 2.5]);
        let mut s = StreamTopN::new(2);
        let kind = s.evaluate(0, 0, 1, cb.stream(0), Observation { fixed: &obs(2.2), raw: &[2.2] }, None);
        assert_eq!(kind, SearchKind::Full);
        assert_eq!(codewords(&s), vec![2, 4]);
        assert_eq!(s.previous(), s.current());
    }

    #[test]
    fn skipped_frames_only_rescore_previous() {
        let cb = codebook(&[0.0, 10.0, 2.0, 5.0]);
        let mut s = StreamTopN::new(2);
        s.evaluate(0, 0, 2, cb.stream(0), Observation { fixed: &obs(9.0), raw: &[9.0] }, None);
        assert_eq!(codewords(&s), vec![1, 3]);
        // Frame 1 is not a multiple of 2: no scan, and prev keeps frame 0.
        let kind = s.evaluate(0, 1, 2, cb.stream(0), Observation { fixed: &obs(4.0), raw: &[4.0] }, None);
        assert_eq!(kind, SearchKind::SeedOnly);
        assert_eq!(codewords(&s), vec![3, 1]);
        assert_eq!(
            s.previous().iter().map(|e| e.codeword).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[test]
    fn placeholders_are_replaced() {
        let cb = codebook(&[0.0, 1.0, 2.0, 3.0]);
        let mut s = StreamTopN::new(3);
        assert!(s.previous().iter().all(|e| e.score == WORST_SCORE));
        s.evaluate(0, 0, 1, cb.stream(0), Observation { fixed: &obs(3.0), raw: &[3.0] }, None);
        assert_eq!(codewords(&s), vec![3, 2, 1]);
        s.reset();
        assert_eq!(s.previous()[2], TopNEntry { codeword: 2, score: WORST_SCORE });
    }

    #[test]
    fn pruned_scan_uses_oracle_candidates() {
        let means = [0.0, 1.0, 2.0, 3.0];
        let cb = codebook(&means);
        let trees = KdTreeSet {
            trees: vec![KdTree::build(&means, 4, 1, 2)],
        };
        let mut s = StreamTopN::new(1);
        // Only the first candidate of the right leaf is scanned.
        let pruning = Pruning {
            oracle: &trees,
            max_depth: 0,
            max_bbi: Some(1),
        };
        let kind = s.evaluate(0, 0, 1, cb.stream(0), Observation { fixed: &obs(3.0), raw: &[3.0] }, Some(pruning));
        assert_eq!(kind, SearchKind::Pruned { candidates: 1 });
        assert_eq!(codewords(&s), vec![2]);
    }

    #[test]
    fn candidates_outside_codebook_are_skipped() {
        let cb = codebook(&[0.0, 1.0, 2.0, 3.0]);
        let o = obs(3.0);
        let mut s = StreamTopN::new(1);
        s.seed(cb.stream(0), &o);
        s.scan_candidates(cb.stream(0), &o, &[7, 3, u32::MAX]);
        assert_eq!(codewords(&s), vec![3]);
    }

    #[test]
    fn insert_keeps_order_and_evicts_worst() {
        let mut list = vec![
            TopNEntry { codeword: 0, score: 10 },
            TopNEntry { codeword: 1, score: 5 },
            TopNEntry { codeword: 2, score: 1 },
        ];
        insert(&mut list, 7, 5);
        assert_eq!(
            list.iter().map(|e| (e.codeword, e.score)).collect::<Vec<_>>(),
            vec![(0, 10), (7, 5), (1, 5)]
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn lists_stay_sorted_and_distinct(
                means in proptest::collection::vec(-20.0f32..20.0, 6..24),
                frames in proptest::collection::vec(-25.0f32..25.0, 1..12),
                topn in 1usize..6,
                ds in 1u32..4,
            ) {
                let cb = codebook(&means);
                let mut s = StreamTopN::new(topn);
                for (t, &x) in frames.iter().enumerate() {
                    s.evaluate(0, t as u32, ds, cb.stream(0), Observation { fixed: &obs(x), raw: &[x] }, None);
                    let list = s.current();
                    prop_assert_eq!(list.len(), topn);
                    prop_assert!(list.windows(2).all(|w| w[0].score >= w[1].score));
                    let mut ids: Vec<u32> = list.iter().map(|e| e.codeword).collect();
                    ids.sort_unstable();
                    ids.dedup();
                    prop_assert_eq!(ids.len(), topn);
                }
            }

            #[test]
            fn full_frames_match_brute_force(
                means in proptest::collection::vec(-20.0f32..20.0, 4..16),
                x in -25.0f32..25.0,
            ) {
                let cb = codebook(&means);
                let mut s = StreamTopN::new(1);
                s.evaluate(0, 0, 1, cb.stream(0), Observation { fixed: &obs(x), raw: &[x] }, None);
                let o = obs(x);
                let best = (0..means.len())
                    .map(|cw| codeword_score(cb.stream(0), cw, &o))
                    .max()
                    .unwrap();
                prop_assert_eq!(s.current()[0].score, best);
            }
        }
    }
}

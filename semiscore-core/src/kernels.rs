//! Senone score accumulation.
//!
//! For every requested senone `s`:
//!
//! ```text
//! score[s] = sum over streams f of
//!            logadd_k( w[f][cw_k][s] + ascr[f][k] )     k over the top-N
//! ```
//!
//! with all values negated 8-bit log probabilities, so smaller is better.
//! The kernel is chosen once at load time ([`ScoringStrategy`]) from the
//! weight layout and top-N size. Shapes 1, 2 and 4 are unrolled; every
//! shape produces bit-identical results to the generic loop.
//!
//! Only requested senones are written. The first stream assigns, later
//! streams add.

use crate::logmath::FastLogAdd;
use crate::mixw::rle::Runs;
use crate::mixw::{nibble, MixtureWeights, WeightLayout, N_CLUSTER};
use crate::topn::{StreamTopN, TopNEntry};

/// Lowest-scoring (most likely) senone of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestSenone {
    pub senone: u32,
    pub score: i16,
}

/// Which senones to score.
#[derive(Debug, Clone, Copy)]
pub enum SenoneSet<'a> {
    /// `0..n`.
    All(usize),
    /// Ascending, distinct indices.
    Active(&'a [u32]),
}

impl SenoneSet<'_> {
    pub fn len(&self) -> usize {
        match self {
            SenoneSet::All(n) => *n,
            SenoneSet::Active(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopNShape {
    One,
    Two,
    Four,
    Generic,
}

impl TopNShape {
    pub fn for_topn(topn: usize) -> Self {
        match topn {
            1 => TopNShape::One,
            2 => TopNShape::Two,
            4 => TopNShape::Four,
            _ => TopNShape::Generic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringStrategy {
    Dense(TopNShape),
    Packed4(TopNShape),
    Rle,
}

impl ScoringStrategy {
    pub fn select(layout: WeightLayout, topn: usize) -> Self {
        let shape = TopNShape::for_topn(topn);
        match layout {
            WeightLayout::Dense => ScoringStrategy::Dense(shape),
            WeightLayout::Packed4 => ScoringStrategy::Packed4(shape),
            WeightLayout::Rle => ScoringStrategy::Rle,
        }
    }

    /// Score `set` into `scores`. `rle_scratch` must hold `n_sen` entries
    /// when the strategy is [`ScoringStrategy::Rle`]; other strategies
    /// ignore it.
    ///
    /// Returns `None` when nothing was scored.
    pub fn score(
        &self,
        mixw: &MixtureWeights,
        lists: &[StreamTopN],
        fast: &FastLogAdd,
        set: SenoneSet<'_>,
        scores: &mut [i16],
        rle_scratch: &mut [i32],
    ) -> Option<BestSenone> {
        let set = match set {
            SenoneSet::All(n) => SenoneSet::All(n.min(mixw.n_sen()).min(scores.len())),
            active => active,
        };
        if set.is_empty() || lists.is_empty() {
            return None;
        }
        let zero = [0u8; N_CLUSTER];
        let cluster = mixw.cluster().unwrap_or(&zero);
        match *self {
            ScoringStrategy::Dense(shape) => accumulate(
                |f, cw| DenseRow(mixw.row(f, cw as usize)),
                lists,
                fast,
                shape,
                set,
                scores,
            ),
            ScoringStrategy::Packed4(shape) => accumulate(
                |f, cw| PackedRow {
                    row: mixw.row(f, cw as usize),
                    cluster,
                },
                lists,
                fast,
                shape,
                set,
                scores,
            ),
            ScoringStrategy::Rle => accumulate_rle(mixw, cluster, lists, fast, set, scores, rle_scratch),
        }
    }
}

trait WeightRow: Copy {
    fn at(self, sen: usize) -> i32;
}

#[derive(Clone, Copy)]
struct DenseRow<'a>(&'a [u8]);

impl WeightRow for DenseRow<'_> {
    #[inline(always)]
    fn at(self, sen: usize) -> i32 {
        i32::from(self.0[sen])
    }
}

#[derive(Clone, Copy)]
struct PackedRow<'a> {
    row: &'a [u8],
    cluster: &'a [u8; N_CLUSTER],
}

impl WeightRow for PackedRow<'_> {
    #[inline(always)]
    fn at(self, sen: usize) -> i32 {
        i32::from(self.cluster[usize::from(nibble(self.row, sen))])
    }
}

/// Fold one stream's term for each senone of `set` into `scores`.
#[inline(always)]
fn apply(
    set: SenoneSet<'_>,
    scores: &mut [i16],
    first: bool,
    best: Option<&mut Option<BestSenone>>,
    term: impl Fn(usize) -> i32,
) {
    let mut best = best;
    let mut visit = |sen: usize| {
        let Some(slot) = scores.get_mut(sen) else {
            return;
        };
        let t = term(sen).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        let v = if first { t } else { slot.saturating_add(t) };
        *slot = v;
        if let Some(best) = best.as_deref_mut() {
            if best.map_or(true, |b| v < b.score) {
                *best = Some(BestSenone {
                    senone: sen as u32,
                    score: v,
                });
            }
        }
    };
    match set {
        SenoneSet::All(n) => (0..n).for_each(&mut visit),
        SenoneSet::Active(list) => list.iter().for_each(|&s| visit(s as usize)),
    }
}

fn accumulate<R: WeightRow>(
    rows: impl Fn(usize, u32) -> R,
    lists: &[StreamTopN],
    fast: &FastLogAdd,
    shape: TopNShape,
    set: SenoneSet<'_>,
    scores: &mut [i16],
) -> Option<BestSenone> {
    let mut best = None;
    let n_feat = lists.len();
    for (f, list) in lists.iter().enumerate() {
        let e: &[TopNEntry] = list.current();
        let first = f == 0;
        let track = (f + 1 == n_feat).then_some(&mut best);
        match (shape, e) {
            (TopNShape::One, [e0, ..]) => {
                let (r0, s0) = (rows(f, e0.codeword), e0.score);
                apply(set, scores, first, track, |sen| r0.at(sen) + s0);
            }
            (TopNShape::Two, [e0, e1, ..]) => {
                let (r0, s0) = (rows(f, e0.codeword), e0.score);
                let (r1, s1) = (rows(f, e1.codeword), e1.score);
                apply(set, scores, first, track, |sen| {
                    fast.add(r0.at(sen) + s0, r1.at(sen) + s1)
                });
            }
            (TopNShape::Four, [e0, e1, e2, e3, ..]) => {
                let (r0, s0) = (rows(f, e0.codeword), e0.score);
                let (r1, s1) = (rows(f, e1.codeword), e1.score);
                let (r2, s2) = (rows(f, e2.codeword), e2.score);
                let (r3, s3) = (rows(f, e3.codeword), e3.score);
                apply(set, scores, first, track, |sen| {
                    let tmp = fast.add(r0.at(sen) + s0, r1.at(sen) + s1);
                    let tmp = fast.add(tmp, r2.at(sen) + s2);
                    fast.add(tmp, r3.at(sen) + s3)
                });
            }
            (_, [e0, rest @ ..]) => {
                let (r0, s0) = (rows(f, e0.codeword), e0.score);
                apply(set, scores, first, track, |sen| {
                    rest.iter().fold(r0.at(sen) + s0, |tmp, e| {
                        fast.add(tmp, rows(f, e.codeword).at(sen) + e.score)
                    })
                });
            }
            (_, []) => {}
        }
    }
    best
}

/// Run-length rows: expand each top-N codeword's row into `scratch`,
/// log-adding across the top-N, then fold `scratch` into the scores.
fn accumulate_rle(
    mixw: &MixtureWeights,
    cluster: &[u8; N_CLUSTER],
    lists: &[StreamTopN],
    fast: &FastLogAdd,
    set: SenoneSet<'_>,
    scores: &mut [i16],
    scratch: &mut [i32],
) -> Option<BestSenone> {
    let n_sen = mixw.n_sen().min(scratch.len());
    let mut best = None;
    let n_feat = lists.len();
    for (f, list) in lists.iter().enumerate() {
        for (k, e) in list.current().iter().enumerate() {
            let row = mixw.row(f, e.codeword as usize);
            let weight = |id: u8| i32::from(cluster[usize::from(id & 0x0f)]) + e.score;
            let put = |slot: &mut i32, w: i32| {
                *slot = if k == 0 { w } else { fast.add(*slot, w) };
            };
            match set {
                SenoneSet::All(_) => {
                    let mut n = 0;
                    for (len, id) in Runs::new(row) {
                        let end = (n + len).min(n_sen);
                        let w = weight(id);
                        for slot in &mut scratch[n..end] {
                            put(slot, w);
                        }
                        n = end;
                        if n >= n_sen {
                            break;
                        }
                    }
                }
                SenoneSet::Active(active) => {
                    let mut runs = Runs::new(row);
                    let (mut start, mut end, mut id) = (0usize, 0usize, 0u8);
                    for &sen in active {
                        let sen = sen as usize;
                        if sen >= n_sen {
                            continue;
                        }
                        if sen < start {
                            runs = Runs::new(row);
                            (start, end) = (0, 0);
                        }
                        while end <= sen {
                            let Some((len, c)) = runs.next() else {
                                break;
                            };
                            start = end;
                            end += len;
                            id = c;
                        }
                        if sen < end {
                            put(&mut scratch[sen], weight(id));
                        }
                    }
                }
            }
        }

        let track = (f + 1 == n_feat).then_some(&mut best);
        let partial = &*scratch;
        apply(set, scores, f == 0, track, |sen| {
            partial.get(sen).copied().unwrap_or(0)
        });
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logmath::{LogMath, DEFAULT_LOG_BASE, SENSCR_SHIFT};
    use crate::mixw::{pack_nibbles, rle, ModelBytes};

    fn fast() -> FastLogAdd {
        FastLogAdd::from_logmath(&LogMath::new(DEFAULT_LOG_BASE, SENSCR_SHIFT, true).unwrap())
            .unwrap()
    }

    fn lists(entries: &[Vec<(u32, i32)>]) -> Vec<StreamTopN> {
        entries
            .iter()
            .map(|e| {
                let mut s = StreamTopN::new(e.len());
                for (slot, &(codeword, score)) in s.current_mut().iter_mut().zip(e) {
                    *slot = TopNEntry { codeword, score };
                }
                s
            })
            .collect()
    }

    fn cluster() -> [u8; N_CLUSTER] {
        let mut c = [0u8; N_CLUSTER];
        for (i, v) in c.iter_mut().enumerate() {
            *v = (i * 10) as u8;
        }
        c
    }

    fn packed(n_feat: usize, n_density: usize, n_sen: usize, ids: &[Vec<u8>]) -> MixtureWeights {
        let mut bytes = Vec::new();
        let mut rows = Vec::new();
        for row in ids {
            let p = pack_nibbles(row);
            rows.push(bytes.len()..bytes.len() + p.len());
            bytes.extend(p);
        }
        MixtureWeights::new(
            n_feat,
            n_density,
            n_sen,
            WeightLayout::Packed4,
            Some(cluster()),
            ModelBytes::Owned(bytes),
            rows,
        )
        .unwrap()
    }

    fn run_length(n_feat: usize, n_density: usize, n_sen: usize, ids: &[Vec<u8>]) -> MixtureWeights {
        let mut bytes = Vec::new();
        let mut rows = Vec::new();
        for row in ids {
            let r = rle::encode_row(row);
            rows.push(bytes.len()..bytes.len() + r.len());
            bytes.extend(r);
        }
        MixtureWeights::new(
            n_feat,
            n_density,
            n_sen,
            WeightLayout::Rle,
            Some(cluster()),
            ModelBytes::Owned(bytes),
            rows,
        )
        .unwrap()
    }

    #[test]
    fn single_codeword_is_plain_sum() {
        // Two streams, two codewords, three senones.
        let mixw = MixtureWeights::dense(2, 2, 3, vec![
            1, 2, 3, /* f0 c0 */ 10, 20, 30, /* f0 c1 */
            5, 5, 5, /* f1 c0 */ 0, 1, 0, /* f1 c1 */
        ])
        .unwrap();
        let lists = lists(&[vec![(1, 4)], vec![(0, 2)]]);
        let mut scores = vec![-1i16; 3];
        let best = ScoringStrategy::select(WeightLayout::Dense, 1)
            .score(&mixw, &lists, &fast(), SenoneSet::All(3), &mut scores, &mut [])
            .unwrap();
        assert_eq!(scores, vec![10 + 4 + 5 + 2, 20 + 4 + 7, 30 + 4 + 7]);
        assert_eq!(best, BestSenone { senone: 0, score: 21 });
    }

    #[test]
    fn only_active_senones_are_written() {
        let mixw = MixtureWeights::dense(1, 1, 4, vec![9, 8, 7, 6]).unwrap();
        let lists = lists(&[vec![(0, 0)]]);
        let mut scores = vec![-1i16; 4];
        let best = ScoringStrategy::Dense(TopNShape::One)
            .score(&mixw, &lists, &fast(), SenoneSet::Active(&[1, 2]), &mut scores, &mut [])
            .unwrap();
        assert_eq!(scores, vec![-1, 8, 7, -1]);
        assert_eq!(best.senone, 2);
        assert!(ScoringStrategy::Dense(TopNShape::One)
            .score(&mixw, &lists, &fast(), SenoneSet::Active(&[]), &mut scores, &mut [])
            .is_none());
    }

    #[test]
    fn best_prefers_first_of_equal_scores() {
        let mixw = MixtureWeights::dense(1, 1, 3, vec![5, 3, 3]).unwrap();
        let lists = lists(&[vec![(0, 0)]]);
        let mut scores = vec![0i16; 3];
        let best = ScoringStrategy::Dense(TopNShape::One)
            .score(&mixw, &lists, &fast(), SenoneSet::All(3), &mut scores, &mut [])
            .unwrap();
        assert_eq!(best.senone, 1);
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(
            ScoringStrategy::select(WeightLayout::Dense, 3),
            ScoringStrategy::Dense(TopNShape::Generic)
        );
        assert_eq!(
            ScoringStrategy::select(WeightLayout::Packed4, 4),
            ScoringStrategy::Packed4(TopNShape::Four)
        );
        assert_eq!(ScoringStrategy::select(WeightLayout::Rle, 2), ScoringStrategy::Rle);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        const N_FEAT: usize = 2;
        const N_DENSITY: usize = 6;

        fn case(topn: usize) -> impl Strategy<Value = (usize, Vec<Vec<u8>>, Vec<Vec<(u32, i32)>>)> {
            (1usize..40).prop_flat_map(move |n_sen| {
                let ids = proptest::collection::vec(
                    proptest::collection::vec(0u8..16, n_sen),
                    N_FEAT * N_DENSITY,
                );
                let entries = proptest::collection::vec(
                    (
                        Just((0..N_DENSITY as u32).collect::<Vec<_>>()).prop_shuffle(),
                        proptest::collection::vec(0i32..=96, topn),
                    )
                        .prop_map(move |(cws, scores)| {
                            let mut scores = scores;
                            scores.sort_unstable();
                            cws.into_iter().zip(scores).take(topn).collect::<Vec<_>>()
                        }),
                    N_FEAT,
                );
                (Just(n_sen), ids, entries)
            })
        }

        fn dense_from_ids(n_sen: usize, ids: &[Vec<u8>]) -> MixtureWeights {
            let c = cluster();
            let data = ids
                .iter()
                .flat_map(|row| row.iter().map(|&id| c[usize::from(id)]))
                .collect();
            MixtureWeights::dense(N_FEAT, N_DENSITY, n_sen, data).unwrap()
        }

        fn run(
            strategy: ScoringStrategy,
            mixw: &MixtureWeights,
            lists: &[StreamTopN],
            set: SenoneSet<'_>,
        ) -> (Vec<i16>, Option<BestSenone>) {
            let mut scores = vec![0i16; mixw.n_sen()];
            let mut scratch = vec![0i32; mixw.n_sen()];
            let best = strategy.score(mixw, lists, &fast(), set, &mut scores, &mut scratch);
            (scores, best)
        }

        fn check_all_layouts(topn: usize, n_sen: usize, ids: &[Vec<u8>], entries: &[Vec<(u32, i32)>]) -> Result<(), TestCaseError> {
            let lists = lists(entries);
            let dense = dense_from_ids(n_sen, ids);
            let packed = packed(N_FEAT, N_DENSITY, n_sen, ids);
            let runs = run_length(N_FEAT, N_DENSITY, n_sen, ids);
            let shape = TopNShape::for_topn(topn);
            let active: Vec<u32> = (0..n_sen as u32).filter(|s| s % 3 != 1).collect();

            for set in [SenoneSet::All(n_sen), SenoneSet::Active(&active)] {
                let generic = run(ScoringStrategy::Dense(TopNShape::Generic), &dense, &lists, set);
                prop_assert_eq!(&run(ScoringStrategy::Dense(shape), &dense, &lists, set), &generic);
                prop_assert_eq!(&run(ScoringStrategy::Packed4(shape), &packed, &lists, set), &generic);
                prop_assert_eq!(&run(ScoringStrategy::Packed4(TopNShape::Generic), &packed, &lists, set), &generic);
                prop_assert_eq!(&run(ScoringStrategy::Rle, &runs, &lists, set), &generic);
            }
            Ok(())
        }

        proptest! {
            #[test]
            fn top1_kernels_agree((n_sen, ids, entries) in case(1)) {
                check_all_layouts(1, n_sen, &ids, &entries)?;
            }

            #[test]
            fn top2_kernels_agree((n_sen, ids, entries) in case(2)) {
                check_all_layouts(2, n_sen, &ids, &entries)?;
            }

            #[test]
            fn top4_kernels_agree((n_sen, ids, entries) in case(4)) {
                check_all_layouts(4, n_sen, &ids, &entries)?;
            }

            #[test]
            fn top3_kernels_agree((n_sen, ids, entries) in case(3)) {
                check_all_layouts(3, n_sen, &ids, &entries)?;
            }
        }
    }
}

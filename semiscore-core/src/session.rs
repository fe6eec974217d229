//! Per-session scoring state and the frame-eval entry point.
//!
//! The model is shared; everything that changes from frame to frame lives
//! here: the previous-frame top-N lists, the active-senone set, the RLE
//! expansion buffer and observation scratch. One session scores one
//! utterance stream at a time.
//!
//! `&mut self` on [`SenoneScorer::frame_eval`] reflects that top-N lists
//! carry state from frame `t` to `t + 1`. Callers that share a session
//! across threads go through [`SessionHandle`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::active::ActiveSenones;
use crate::diagnostics::ScoringDiagnostics;
use crate::fixpoint::{observation_into, Mean};
use crate::hmm::{HmmTopology, SenoneSequences};
use crate::kernels::{BestSenone, ScoringStrategy, SenoneSet};
use crate::model::SemiContModel;
use crate::normalize::normalize_topn;
use crate::topn::{Observation, SearchKind, StreamTopN, TopNEntry};

/// Contract between the decoder and a senone scorer.
pub trait SenoneScorer: Send + 'static {
    fn n_senones(&self) -> usize;

    /// The active set the decoder rebuilds before each "active only" frame.
    fn active_senones(&mut self) -> &mut ActiveSenones;

    /// Score one frame.
    ///
    /// # Parameters
    /// - `feats`: one feature vector per stream.
    /// - `frame`: frame index, used for the downsampling decision.
    /// - `compute_all`: score every senone instead of the active list.
    /// - `scores`: output, indexed by senone. Only scored senones are
    ///   written; the rest keep their previous contents.
    ///
    /// # Returns
    /// The best (lowest) score and its senone, or `None` when no senone was
    /// requested.
    fn frame_eval(
        &mut self,
        feats: &[&[f32]],
        frame: u32,
        compute_all: bool,
        scores: &mut [i16],
    ) -> Option<BestSenone>;

    /// Forget all previous-frame state (e.g. between utterances).
    fn reset(&mut self);
}

pub struct ScoringSession {
    model: Arc<SemiContModel>,
    topn: Vec<StreamTopN>,
    active: ActiveSenones,
    rle_scratch: Vec<i32>,
    obs: Vec<Mean>,
    diagnostics: Arc<ScoringDiagnostics>,
}

impl ScoringSession {
    pub fn new(model: Arc<SemiContModel>) -> Self {
        let n_sen = model.n_senones();
        let topn = (0..model.n_feat())
            .map(|_| StreamTopN::new(model.topn()))
            .collect();
        let rle_scratch = if model.strategy() == ScoringStrategy::Rle {
            vec![0; n_sen]
        } else {
            Vec::new()
        };
        debug!(n_sen, n_feat = model.n_feat(), "scoring session created");
        Self {
            topn,
            active: ActiveSenones::new(n_sen),
            rle_scratch,
            obs: Vec::new(),
            diagnostics: Arc::new(ScoringDiagnostics::default()),
            model,
        }
    }

    pub fn model(&self) -> &Arc<SemiContModel> {
        &self.model
    }

    pub fn diagnostics(&self) -> Arc<ScoringDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    /// Current (normalized) top-N list of `stream` after the last frame.
    pub fn topn(&self, stream: usize) -> &[TopNEntry] {
        self.topn.get(stream).map(StreamTopN::current).unwrap_or(&[])
    }

    pub fn clear_active(&mut self) {
        self.active.clear();
    }

    pub fn mark_hmm_active(&mut self, hmm: &impl HmmTopology, sseq: &SenoneSequences) {
        self.active.mark_hmm_active(hmm, sseq);
    }

    /// Returns the number of active senones.
    pub fn build_active_list(&mut self) -> usize {
        self.active.flags_to_list()
    }

    fn record_search(&self, kind: SearchKind) {
        let d = &self.diagnostics;
        match kind {
            SearchKind::SeedOnly => d.seed_only_frames.fetch_add(1, Ordering::Relaxed),
            SearchKind::Full => d.full_search_frames.fetch_add(1, Ordering::Relaxed),
            SearchKind::Pruned { candidates } => {
                d.kd_candidates.fetch_add(candidates, Ordering::Relaxed);
                d.pruned_search_frames.fetch_add(1, Ordering::Relaxed)
            }
        };
    }
}

impl SenoneScorer for ScoringSession {
    fn n_senones(&self) -> usize {
        self.model.n_senones()
    }

    fn active_senones(&mut self) -> &mut ActiveSenones {
        &mut self.active
    }

    fn frame_eval(
        &mut self,
        feats: &[&[f32]],
        frame: u32,
        compute_all: bool,
        scores: &mut [i16],
    ) -> Option<BestSenone> {
        let model = Arc::clone(&self.model);
        debug_assert_eq!(feats.len(), model.n_feat(), "one feature vector per stream");
        debug_assert!(scores.len() >= model.n_senones(), "score buffer too short");

        let pruning = model.pruning();
        for f in 0..model.n_feat() {
            let raw = feats.get(f).copied().unwrap_or(&[]);
            observation_into(raw, &mut self.obs);
            let kind = self.topn[f].evaluate(
                f,
                frame,
                model.ds_ratio(),
                model.codebooks().stream(f),
                Observation {
                    fixed: &self.obs,
                    raw,
                },
                pruning,
            );
            self.record_search(kind);
            normalize_topn(self.topn[f].current_mut(), model.lmath_8b());
        }

        let set = if compute_all {
            SenoneSet::All(model.n_senones())
        } else {
            if self.active.is_stale() {
                self.diagnostics
                    .stale_active_lists
                    .fetch_add(1, Ordering::Relaxed);
                warn!(frame, "active senone list was not rebuilt after the last change");
                debug_assert!(false, "active senone list is stale");
            }
            SenoneSet::Active(self.active.list())
        };

        self.diagnostics.frames_scored.fetch_add(1, Ordering::Relaxed);
        self.diagnostics
            .senones_scored
            .fetch_add(set.len(), Ordering::Relaxed);

        model.strategy().score(
            model.mixture_weights(),
            &self.topn,
            model.fast_add(),
            set,
            scores,
            &mut self.rle_scratch,
        )
    }

    fn reset(&mut self) {
        for s in &mut self.topn {
            s.reset();
        }
        self.active.clear();
        self.active.flags_to_list();
    }
}

impl std::fmt::Debug for ScoringSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringSession")
            .field("model", &self.model)
            .field("n_active", &self.active.len())
            .finish_non_exhaustive()
    }
}

/// Thread-safe reference-counted handle to a scoring session.
///
/// `parking_lot::Mutex` does not poison when a holder panics.
#[derive(Clone)]
pub struct SessionHandle(pub Arc<Mutex<ScoringSession>>);

impl SessionHandle {
    pub fn new(session: ScoringSession) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").finish_non_exhaustive()
    }
}

//! # semiscore-core
//!
//! Semi-continuous acoustic senone scorer.
//!
//! ## Architecture
//!
//! ```text
//! mean/var files ──► CodebookSet ─┐
//! mixw / sendump ──► MixtureWeights├─► SemiContModel (Arc, read-only)
//! kd-tree file   ──► KdTreeSet   ─┘          │
//!                                            ▼
//! features ──► ScoringSession::frame_eval
//!                 per stream: StreamTopN (seed, scan, commit)
//!                             normalize_topn
//!                 ScoringStrategy kernel over all / active senones
//!                              │
//!                              ▼
//!                 scores[senone], BestSenone
//! ```
//!
//! All scores are negated log probabilities: smaller is better. Loading is
//! the only fallible step; scoring a frame never fails.
//!
//! ## Features
//!
//! - `mmap` (default): memory-map `sendump` files.
//! - `fixed-point`: integer Gaussian evaluation.

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod active;
pub mod bio;
pub mod codebook;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fixpoint;
pub mod hmm;
pub mod kdtree;
pub mod kernels;
pub mod logmath;
pub mod mixw;
pub mod model;
pub mod normalize;
pub mod session;
pub mod topn;

// Convenience re-exports for downstream crates
pub use active::ActiveSenones;
pub use config::{load_config, save_config, ScorerConfig};
pub use diagnostics::{DiagnosticsSnapshot, ScoringDiagnostics};
pub use error::{Result, ScoreError};
pub use hmm::{Hmm, HmmTopology, SenoneSequences};
pub use kdtree::{CandidateOracle, KdTreeSet};
pub use kernels::{BestSenone, ScoringStrategy};
pub use model::SemiContModel;
pub use session::{ScoringSession, SenoneScorer, SessionHandle};

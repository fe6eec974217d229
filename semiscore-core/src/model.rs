//! The shared, read-only half of the scorer: codebooks, mixture weights,
//! log tables, the optional k-d trees and the kernel chosen for them.
//!
//! A model is loaded once and handed to any number of
//! [`ScoringSession`](crate::session::ScoringSession)s through an `Arc`.

use std::sync::Arc;

use tracing::{debug, info};

use crate::codebook::CodebookSet;
use crate::config::ScorerConfig;
use crate::error::{Result, ScoreError};
use crate::hmm::SenoneSequences;
use crate::kdtree::{CandidateOracle, KdTreeSet};
use crate::kernels::ScoringStrategy;
use crate::logmath::{FastLogAdd, LogMath, SENSCR_SHIFT};
use crate::mixw::{read_mixw, read_sendump, MixtureWeights};
use crate::topn::Pruning;

/// Senone indices are stored as `u32` and must also fit an `i32`.
pub const MAX_SENONES: usize = i32::MAX as usize;

pub struct SemiContModel {
    topn: usize,
    ds_ratio: u32,
    kd_max_depth: usize,
    kd_max_bbi: Option<usize>,
    lmath_8b: LogMath,
    fast: FastLogAdd,
    codebooks: CodebookSet,
    mixw: MixtureWeights,
    strategy: ScoringStrategy,
    oracle: Option<Box<dyn CandidateOracle>>,
}

impl SemiContModel {
    /// Load every file named by `config`.
    ///
    /// # Errors
    /// Any load failure is fatal for the model; see [`ScoreError`].
    pub fn load(config: &ScorerConfig) -> Result<Arc<Self>> {
        let mut config = config.clone();
        config.normalize();

        let lmath = LogMath::new(config.log_base, 0, false)?;
        let lmath_8b = LogMath::new(config.log_base, SENSCR_SHIFT, true)?;

        let mean_path = ScorerConfig::require(&config.mean_path, "meanPath")?;
        let var_path = ScorerConfig::require(&config.var_path, "varPath")?;
        let codebooks = CodebookSet::load(&mean_path, &var_path, config.var_floor, &lmath)?;
        let (n_feat, n_density) = (codebooks.n_feat(), codebooks.n_density());

        let mixw = match (&config.sendump_path, &config.mixw_path) {
            (Some(dump), _) => read_sendump(dump, n_feat, n_density, config.n_senones, config.mmap)?,
            (None, Some(mixw)) => read_mixw(
                mixw,
                n_feat,
                n_density,
                config.n_senones,
                config.mixw_floor,
                &lmath_8b,
            )?,
            (None, None) => {
                return Err(ScoreError::Config(
                    "neither sendumpPath nor mixwPath is configured".into(),
                ))
            }
        };

        let oracle = match &config.kdtree_path {
            Some(path) => {
                let trees = KdTreeSet::load(path, Some(codebooks.n_feat()))?;
                check_trees(&trees, &codebooks)?;
                Some(Box::new(trees) as Box<dyn CandidateOracle>)
            }
            None => None,
        };

        Self::from_parts(&config, lmath_8b, codebooks, mixw, oracle).map(Arc::new)
    }

    /// Assemble a model from already-loaded parts. Only the search
    /// parameters of `config` are used.
    pub fn from_parts(
        config: &ScorerConfig,
        lmath_8b: LogMath,
        codebooks: CodebookSet,
        mixw: MixtureWeights,
        oracle: Option<Box<dyn CandidateOracle>>,
    ) -> Result<Self> {
        let fast = FastLogAdd::from_logmath(&lmath_8b)?;

        if mixw.n_feat() != codebooks.n_feat() {
            return Err(ScoreError::DimensionMismatch {
                what: "feature stream count",
                expected: codebooks.n_feat(),
                found: mixw.n_feat(),
            });
        }
        if mixw.n_density() != codebooks.n_density() {
            return Err(ScoreError::DimensionMismatch {
                what: "codewords per stream",
                expected: codebooks.n_density(),
                found: mixw.n_density(),
            });
        }
        if mixw.n_sen() > MAX_SENONES {
            return Err(ScoreError::Config(format!(
                "{} senones exceed the limit of {MAX_SENONES}",
                mixw.n_sen()
            )));
        }
        if config.topn == 0 || config.topn > codebooks.n_density() {
            return Err(ScoreError::Config(format!(
                "topn {} must be between 1 and the codebook size {}",
                config.topn,
                codebooks.n_density()
            )));
        }
        if let Some(oracle) = &oracle {
            if oracle.n_trees() != codebooks.n_feat() {
                return Err(ScoreError::Config(format!(
                    "{} kd-trees for {} feature streams",
                    oracle.n_trees(),
                    codebooks.n_feat()
                )));
            }
            for f in 0..codebooks.n_feat() {
                if oracle.n_codewords(f) > codebooks.n_density() {
                    return Err(ScoreError::DimensionMismatch {
                        what: "kd-tree codewords",
                        expected: codebooks.n_density(),
                        found: oracle.n_codewords(f),
                    });
                }
            }
        }

        let strategy = ScoringStrategy::select(mixw.layout(), config.topn);
        info!(
            n_feat = codebooks.n_feat(),
            n_density = codebooks.n_density(),
            n_sen = mixw.n_sen(),
            topn = config.topn,
            ds_ratio = config.ds_ratio,
            kd_trees = oracle.is_some(),
            ?strategy,
            "semi-continuous model ready"
        );

        Ok(Self {
            topn: config.topn,
            ds_ratio: config.ds_ratio.max(1),
            kd_max_depth: config.kd_max_depth,
            kd_max_bbi: usize::try_from(config.kd_max_bbi).ok(),
            lmath_8b,
            fast,
            codebooks,
            mixw,
            strategy,
            oracle,
        })
    }

    pub fn topn(&self) -> usize {
        self.topn
    }

    pub fn ds_ratio(&self) -> u32 {
        self.ds_ratio
    }

    pub fn n_feat(&self) -> usize {
        self.codebooks.n_feat()
    }

    pub fn n_density(&self) -> usize {
        self.codebooks.n_density()
    }

    pub fn n_senones(&self) -> usize {
        self.mixw.n_sen()
    }

    pub fn codebooks(&self) -> &CodebookSet {
        &self.codebooks
    }

    pub fn mixture_weights(&self) -> &MixtureWeights {
        &self.mixw
    }

    pub fn strategy(&self) -> ScoringStrategy {
        self.strategy
    }

    pub fn lmath_8b(&self) -> &LogMath {
        &self.lmath_8b
    }

    pub fn fast_add(&self) -> &FastLogAdd {
        &self.fast
    }

    /// k-d tree pruning parameters, when trees were loaded.
    pub fn pruning(&self) -> Option<Pruning<'_>> {
        self.oracle.as_deref().map(|oracle| Pruning {
            oracle,
            max_depth: self.kd_max_depth,
            max_bbi: self.kd_max_bbi,
        })
    }

    /// Check a decoder's senone sequences against this model before any HMM
    /// built on them is marked active.
    pub fn check_sequences(&self, sseq: &SenoneSequences) -> Result<()> {
        if let Some(max) = sseq.max_senone() {
            if max as usize >= self.n_senones() {
                return Err(ScoreError::DimensionMismatch {
                    what: "senone id in senone sequences",
                    expected: self.n_senones(),
                    found: max as usize,
                });
            }
        }
        debug!(
            n_ssid = sseq.n_ssid(),
            n_emit_state = sseq.n_emit_state(),
            "senone sequences checked"
        );
        Ok(())
    }
}

impl std::fmt::Debug for SemiContModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemiContModel")
            .field("topn", &self.topn)
            .field("ds_ratio", &self.ds_ratio)
            .field("n_feat", &self.n_feat())
            .field("n_density", &self.n_density())
            .field("n_senones", &self.n_senones())
            .field("strategy", &self.strategy)
            .field("kd_trees", &self.oracle.is_some())
            .finish_non_exhaustive()
    }
}

fn check_trees(trees: &KdTreeSet, codebooks: &CodebookSet) -> Result<()> {
    for (f, tree) in trees.trees.iter().enumerate() {
        if tree.n_comp != codebooks.veclen(f) {
            return Err(ScoreError::Config(format!(
                "kd-tree {f} has {} components, stream {f} has length {}",
                tree.n_comp,
                codebooks.veclen(f)
            )));
        }
        if tree.n_density != codebooks.n_density() {
            return Err(ScoreError::Config(format!(
                "kd-tree {f} indexes {} codewords, codebook has {}",
                tree.n_density,
                codebooks.n_density()
            )));
        }
    }
    Ok(())
}

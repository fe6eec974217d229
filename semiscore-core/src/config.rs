//! Scorer configuration (JSON file plus `SEMISCORE_*` environment overrides).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoreError};
use crate::logmath::DEFAULT_LOG_BASE;

/// Largest accepted top-N.
pub const MAX_TOPN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ScorerConfig {
    pub mean_path: Option<PathBuf>,
    pub var_path: Option<PathBuf>,
    pub mixw_path: Option<PathBuf>,
    /// Takes precedence over `mixw_path` when both are set.
    pub sendump_path: Option<PathBuf>,
    pub kdtree_path: Option<PathBuf>,
    /// 0 descends to the leaves.
    pub kd_max_depth: usize,
    /// Candidate limit per leaf; -1 means unlimited.
    pub kd_max_bbi: i32,
    pub topn: usize,
    pub ds_ratio: u32,
    pub var_floor: f32,
    pub mixw_floor: f32,
    pub mmap: bool,
    pub log_base: f64,
    /// Senone count the decoder's model definition expects, if known.
    pub n_senones: Option<usize>,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            mean_path: None,
            var_path: None,
            mixw_path: None,
            sendump_path: None,
            kdtree_path: None,
            kd_max_depth: 0,
            kd_max_bbi: -1,
            topn: 4,
            ds_ratio: 1,
            var_floor: 0.0001,
            mixw_floor: 0.000_000_1,
            mmap: true,
            log_base: DEFAULT_LOG_BASE,
            n_senones: None,
        }
    }
}

impl ScorerConfig {
    pub fn normalize(&mut self) {
        self.topn = self.topn.clamp(1, MAX_TOPN);
        self.ds_ratio = self.ds_ratio.max(1);
        if !(self.var_floor > 0.0) {
            self.var_floor = 0.0001;
        }
        if !(self.mixw_floor > 0.0) {
            self.mixw_floor = 0.000_000_1;
        }
        if !(self.log_base > 1.0 && self.log_base <= 2.0) {
            self.log_base = DEFAULT_LOG_BASE;
        }
        if self.kd_max_bbi < -1 {
            self.kd_max_bbi = -1;
        }
        self.mean_path = non_empty(self.mean_path.take());
        self.var_path = non_empty(self.var_path.take());
        self.mixw_path = non_empty(self.mixw_path.take());
        self.sendump_path = non_empty(self.sendump_path.take());
        self.kdtree_path = non_empty(self.kdtree_path.take());
    }

    /// Override fields from `SEMISCORE_TOPN`, `SEMISCORE_DS`, `SEMISCORE_MMAP`
    /// and `SEMISCORE_KDTREE`, then re-normalize.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(topn) = lookup("SEMISCORE_TOPN").and_then(|v| v.trim().parse::<usize>().ok()) {
            self.topn = topn;
        }
        if let Some(ds) = lookup("SEMISCORE_DS").and_then(|v| v.trim().parse::<u32>().ok()) {
            self.ds_ratio = ds;
        }
        if let Some(v) = lookup("SEMISCORE_MMAP") {
            self.mmap = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(v) = lookup("SEMISCORE_KDTREE") {
            self.kdtree_path = Some(PathBuf::from(v));
        }
        self.normalize();
    }

    pub(crate) fn require(path: &Option<PathBuf>, what: &str) -> Result<PathBuf> {
        path.clone()
            .ok_or_else(|| ScoreError::Config(format!("{what} is not configured")))
    }
}

fn non_empty(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

/// Read a config file. A missing or unparseable file yields defaults.
pub fn load_config(path: &Path) -> ScorerConfig {
    let mut config = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<ScorerConfig>(&raw).ok())
        .unwrap_or_default();
    config.normalize();
    config
}

pub fn save_config(path: &Path, config: &ScorerConfig) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

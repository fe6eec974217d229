//! k-d trees over codebook means, used to prune the per-frame codebook scan.
//!
//! The scorer only needs an oracle: "given an observation and a depth,
//! return a bounded set of candidate codewords". [`CandidateOracle`] is that
//! seam; [`KdTreeSet`] is the file-backed implementation.
//!
//! ## File format (text, whitespace separated)
//!
//! ```text
//! KD-TREES
//! version 1
//! n_trees <n>
//! TREE <i>
//! n_density <codewords>
//! n_comp <vector length>
//! n_level <levels>
//! threshold <float>
//! NODE <k>                  (breadth-first, k = 0 .. 2^n_level - 1)
//! split_comp <dim>
//! split_plane <float>
//! bbi <cw> <cw> ...
//! ```
//!
//! Children of node `k` are `2k + 1` (left, `obs[split_comp] < split_plane`)
//! and `2k + 2`.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::{Result, ScoreError};

pub trait CandidateOracle: Send + Sync {
    fn n_trees(&self) -> usize;

    /// Every candidate returned for `stream` is below this.
    fn n_codewords(&self, stream: usize) -> usize;

    /// Candidate codewords for `obs` in `stream`, descending at most
    /// `max_depth` levels (0 = to the leaves).
    fn candidates(&self, stream: usize, obs: &[f32], max_depth: usize) -> &[u32];
}

#[derive(Debug, Clone)]
pub struct KdNode {
    pub split_comp: usize,
    pub split_plane: f32,
    pub bbi: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct KdTree {
    pub n_density: usize,
    pub n_comp: usize,
    pub n_level: usize,
    pub threshold: f32,
    pub nodes: Vec<KdNode>,
}

impl KdTree {
    /// Build a tree by splitting codeword means at the median of their
    /// widest dimension. Each node's candidates are the codewords in its
    /// partition.
    pub fn build(means: &[f32], n_density: usize, n_comp: usize, n_level: usize) -> Self {
        let n_level = n_level.max(1);
        let n_nodes = (1usize << n_level) - 1;
        let mut nodes = Vec::with_capacity(n_nodes);
        let mut parts: Vec<Vec<u32>> = vec![(0..n_density as u32).collect()];
        let mean = |cw: u32, d: usize| means[cw as usize * n_comp + d];

        for k in 0..n_nodes {
            let part = std::mem::take(&mut parts[k]);
            let (mut split_comp, mut spread) = (0, f32::MIN);
            for d in 0..n_comp {
                let (lo, hi) = part.iter().fold((f32::MAX, f32::MIN), |(lo, hi), &cw| {
                    (lo.min(mean(cw, d)), hi.max(mean(cw, d)))
                });
                if hi - lo > spread {
                    spread = hi - lo;
                    split_comp = d;
                }
            }
            let mut vals: Vec<f32> = part.iter().map(|&cw| mean(cw, split_comp)).collect();
            vals.sort_by(f32::total_cmp);
            let split_plane = vals.get(vals.len() / 2).copied().unwrap_or(0.0);

            if 2 * k + 2 < n_nodes {
                let (left, right): (Vec<u32>, Vec<u32>) = part
                    .iter()
                    .partition(|&&cw| mean(cw, split_comp) < split_plane);
                parts.resize(2 * k + 3, Vec::new());
                parts[2 * k + 1] = left;
                parts[2 * k + 2] = right;
            }
            nodes.push(KdNode {
                split_comp,
                split_plane,
                bbi: part,
            });
        }

        Self {
            n_density,
            n_comp,
            n_level,
            threshold: 0.0,
            nodes,
        }
    }

    pub fn descend(&self, obs: &[f32], max_depth: usize) -> &KdNode {
        let limit = if max_depth == 0 {
            self.n_level
        } else {
            max_depth.min(self.n_level)
        };
        let mut k = 0;
        let mut depth = 1;
        while depth < limit {
            let node = &self.nodes[k];
            let x = obs.get(node.split_comp).copied().unwrap_or(0.0);
            let child = if x < node.split_plane { 2 * k + 1 } else { 2 * k + 2 };
            if child >= self.nodes.len() {
                break;
            }
            k = child;
            depth += 1;
        }
        &self.nodes[k]
    }
}

/// Fewest tokens a `TREE` header or a `NODE` record can take.
const TREE_TOKENS: usize = 10;
const NODE_TOKENS: usize = 7;

#[derive(Debug)]
enum TreeFileError {
    Malformed(String),
    TreeCount { found: usize, expected: usize },
}

impl From<String> for TreeFileError {
    fn from(reason: String) -> Self {
        TreeFileError::Malformed(reason)
    }
}

#[derive(Debug, Clone, Default)]
pub struct KdTreeSet {
    pub trees: Vec<KdTree>,
}

impl KdTreeSet {
    /// Read a tree file. With `n_streams` set, a file holding a different
    /// number of trees is rejected before any tree is parsed.
    pub fn load(path: &Path, n_streams: Option<usize>) -> Result<Self> {
        info!("Reading kd-trees from '{}'", path.display());
        let text = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ScoreError::ModelNotFound {
                path: path.to_path_buf(),
            },
            _ => ScoreError::Io(e),
        })?;
        let set = Self::parse(&text, n_streams).map_err(|e| match e {
            TreeFileError::Malformed(reason) => ScoreError::format(path, reason),
            TreeFileError::TreeCount { found, expected } => ScoreError::Config(format!(
                "{found} kd-trees in {} for {expected} feature streams",
                path.display()
            )),
        })?;
        info!("Read {} kd-trees", set.trees.len());
        Ok(set)
    }

    fn parse(text: &str, n_streams: Option<usize>) -> std::result::Result<Self, TreeFileError> {
        let mut tok = Tokens {
            toks: text.split_whitespace().collect(),
            pos: 0,
        };
        tok.keyword("KD-TREES")?;
        tok.keyword("version")?;
        let version: u32 = tok.value("version")?;
        if version != 1 {
            return Err(format!("unsupported kd-tree version {version}").into());
        }
        tok.keyword("n_trees")?;
        let n_trees: usize = tok.value("n_trees")?;
        if let Some(expected) = n_streams.filter(|&n| n != n_trees) {
            return Err(TreeFileError::TreeCount {
                found: n_trees,
                expected,
            });
        }
        if n_trees > tok.remaining() / TREE_TOKENS {
            return Err(format!("n_trees {n_trees} exceeds the file contents").into());
        }

        let mut trees = Vec::with_capacity(n_trees);
        for i in 0..n_trees {
            tok.keyword("TREE")?;
            let idx: usize = tok.value("tree index")?;
            if idx != i {
                return Err(format!("expected TREE {i}, found TREE {idx}").into());
            }
            tok.keyword("n_density")?;
            let n_density: usize = tok.value("n_density")?;
            tok.keyword("n_comp")?;
            let n_comp: usize = tok.value("n_comp")?;
            tok.keyword("n_level")?;
            let n_level: usize = tok.value("n_level")?;
            if n_level == 0 || n_level > 24 {
                return Err(format!("tree {i}: n_level {n_level} out of range").into());
            }
            tok.keyword("threshold")?;
            let threshold: f32 = tok.value("threshold")?;

            let n_nodes = (1usize << n_level) - 1;
            if n_nodes > tok.remaining() / NODE_TOKENS {
                return Err(format!("tree {i}: {n_nodes} nodes exceed the file contents").into());
            }
            let mut nodes = Vec::with_capacity(n_nodes);
            for k in 0..n_nodes {
                tok.keyword("NODE")?;
                let node_idx: usize = tok.value("node index")?;
                if node_idx != k {
                    return Err(format!("tree {i}: expected NODE {k}, found NODE {node_idx}").into());
                }
                tok.keyword("split_comp")?;
                let split_comp: usize = tok.value("split_comp")?;
                if split_comp >= n_comp {
                    return Err(
                        format!("tree {i} node {k}: split_comp {split_comp} >= {n_comp}").into(),
                    );
                }
                tok.keyword("split_plane")?;
                let split_plane: f32 = tok.value("split_plane")?;
                tok.keyword("bbi")?;
                let mut bbi = Vec::new();
                while let Some(cw) = tok.peek_u32() {
                    if cw as usize >= n_density {
                        return Err(format!("tree {i} node {k}: codeword {cw} >= {n_density}").into());
                    }
                    bbi.push(cw);
                    tok.pos += 1;
                }
                nodes.push(KdNode {
                    split_comp,
                    split_plane,
                    bbi,
                });
            }
            trees.push(KdTree {
                n_density,
                n_comp,
                n_level,
                threshold,
                nodes,
            });
        }
        if let Some(extra) = tok.toks.get(tok.pos) {
            return Err(format!("unexpected trailing token '{extra}'").into());
        }
        Ok(Self { trees })
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "KD-TREES\nversion 1\nn_trees {}", self.trees.len());
        for (i, t) in self.trees.iter().enumerate() {
            let _ = writeln!(
                out,
                "TREE {i}\nn_density {}\nn_comp {}\nn_level {}\nthreshold {}",
                t.n_density, t.n_comp, t.n_level, t.threshold
            );
            for (k, node) in t.nodes.iter().enumerate() {
                let _ = write!(
                    out,
                    "NODE {k}\nsplit_comp {}\nsplit_plane {}\nbbi",
                    node.split_comp, node.split_plane
                );
                for cw in &node.bbi {
                    let _ = write!(out, " {cw}");
                }
                out.push('\n');
            }
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text())?;
        Ok(())
    }
}

impl CandidateOracle for KdTreeSet {
    fn n_trees(&self) -> usize {
        self.trees.len()
    }

    fn n_codewords(&self, stream: usize) -> usize {
        self.trees.get(stream).map_or(0, |tree| tree.n_density)
    }

    fn candidates(&self, stream: usize, obs: &[f32], max_depth: usize) -> &[u32] {
        match self.trees.get(stream) {
            Some(tree) => &tree.descend(obs, max_depth).bbi,
            None => &[],
        }
    }
}

struct Tokens<'a> {
    toks: Vec<&'a str>,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn remaining(&self) -> usize {
        self.toks.len() - self.pos
    }

    fn next(&mut self) -> Option<&'a str> {
        let t = self.toks.get(self.pos).copied();
        self.pos += usize::from(t.is_some());
        t
    }

    fn keyword(&mut self, kw: &str) -> std::result::Result<(), String> {
        match self.next() {
            Some(t) if t == kw => Ok(()),
            Some(t) => Err(format!("expected '{kw}', found '{t}'")),
            None => Err(format!("expected '{kw}', found end of file")),
        }
    }

    fn value<T: std::str::FromStr>(&mut self, what: &str) -> std::result::Result<T, String> {
        let t = self
            .next()
            .ok_or_else(|| format!("missing value for {what}"))?;
        t.parse()
            .map_err(|_| format!("bad value '{t}' for {what}"))
    }

    fn peek_u32(&mut self) -> Option<u32> {
        self.toks.get(self.pos).and_then(|t| t.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Four 1-D codewords at 0, 1, 2, 3.
    fn line_tree() -> KdTree {
        KdTree::build(&[0.0, 1.0, 2.0, 3.0], 4, 1, 2)
    }

    #[test]
    fn build_splits_at_median() {
        let t = line_tree();
        assert_eq!(t.nodes.len(), 3);
        assert_eq!(t.nodes[0].split_plane, 2.0);
        assert_eq!(t.nodes[1].bbi, vec![0, 1]);
        assert_eq!(t.nodes[2].bbi, vec![2, 3]);
    }

    #[test]
    fn descent_respects_max_depth() {
        let set = KdTreeSet {
            trees: vec![line_tree()],
        };
        assert_eq!(set.candidates(0, &[0.4], 0), &[0, 1]);
        assert_eq!(set.candidates(0, &[2.5], 0), &[2, 3]);
        assert_eq!(set.candidates(0, &[2.5], 1), &[0, 1, 2, 3]);
        assert!(set.candidates(1, &[2.5], 0).is_empty());
    }

    #[test]
    fn text_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kdtrees");
        let set = KdTreeSet {
            trees: vec![line_tree(), line_tree()],
        };
        set.save(&path).unwrap();
        let back = KdTreeSet::load(&path, Some(2)).unwrap();
        assert_eq!(back.trees.len(), 2);
        assert_eq!(back.trees[1].nodes[2].bbi, vec![2, 3]);
        assert_eq!(back.candidates(1, &[0.0], 0), &[0, 1]);
    }

    #[test]
    fn malformed_files_are_format_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kdtrees");
        let mut text = KdTreeSet {
            trees: vec![line_tree()],
        }
        .to_text();
        text = text.replace("bbi 2 3", "bbi 2 9");
        fs::write(&path, text).unwrap();
        assert!(matches!(KdTreeSet::load(&path, None), Err(ScoreError::Format { .. })));

        fs::write(&path, "KD-TREES\nversion 2\n").unwrap();
        assert!(matches!(KdTreeSet::load(&path, None), Err(ScoreError::Format { .. })));
    }

    #[test]
    fn declared_counts_beyond_file_contents_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kdtrees");
        fs::write(&path, "KD-TREES\nversion 1\nn_trees 1000000000000000\n").unwrap();
        assert!(matches!(KdTreeSet::load(&path, None), Err(ScoreError::Format { .. })));

        let deep = "KD-TREES\nversion 1\nn_trees 1\nTREE 0\nn_density 4\nn_comp 1\n\
                    n_level 24\nthreshold 0\nNODE 0\nsplit_comp 0\nsplit_plane 0\nbbi 0\n";
        fs::write(&path, deep).unwrap();
        assert!(matches!(KdTreeSet::load(&path, None), Err(ScoreError::Format { .. })));
    }

    #[test]
    fn tree_count_is_checked_against_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kdtrees");
        KdTreeSet {
            trees: vec![line_tree()],
        }
        .save(&path)
        .unwrap();
        assert!(matches!(KdTreeSet::load(&path, Some(3)), Err(ScoreError::Config(_))));
        assert_eq!(KdTreeSet::load(&path, Some(1)).unwrap().trees.len(), 1);

        fs::write(&path, "KD-TREES\nversion 1\nn_trees 1000000000000000\n").unwrap();
        assert!(matches!(KdTreeSet::load(&path, Some(2)), Err(ScoreError::Config(_))));
    }
}

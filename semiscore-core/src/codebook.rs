//! Codebook store: per-stream Gaussian means, scaled precisions and
//! determinants, loaded from a Sphinx-3 mean/variance file pair.
//!
//! ## File layout (after the [`crate::bio`] header)
//!
//! ```text
//! i32 n_codebooks        (must be 1)
//! i32 n_streams
//! i32 n_density          (codewords per stream)
//! i32 veclen[n_streams]
//! i32 n_floats           (== n_density * sum(veclen))
//! f32 stream_0[n_density * veclen[0]]
//! ...
//! ```
//!
//! ## Precomputation
//!
//! With `v = max(var, var_floor)` for every dimension:
//!
//! ```text
//! det[cw]    = sum_dim log_b(1 / sqrt(2 pi v))
//! prec[dim]  = ln_to_log(1 / (2 v))
//! ```
//!
//! so that `det - sum (x - mean)^2 * prec` is the codeword's log density in
//! the full-resolution log domain.

use std::path::Path;

use tracing::{debug, info};

use crate::bio::{ByteOrder, S3Reader, S3Writer};
use crate::error::{Result, ScoreError};
use crate::fixpoint::{mean_from_f32, var_from_log, Mean, Var};
use crate::logmath::LogMath;

pub const MGAU_PARAM_VERSION: &str = "1.0";

/// One stream's codebook, stored codeword-major.
#[derive(Debug, Clone)]
pub struct Codebook {
    veclen: usize,
    means: Vec<Mean>,
    precisions: Vec<Var>,
    dets: Vec<Var>,
}

impl Codebook {
    pub fn veclen(&self) -> usize {
        self.veclen
    }

    pub fn n_density(&self) -> usize {
        self.dets.len()
    }

    #[inline]
    pub fn mean(&self, cw: usize) -> &[Mean] {
        &self.means[cw * self.veclen..(cw + 1) * self.veclen]
    }

    #[inline]
    pub fn precision(&self, cw: usize) -> &[Var] {
        &self.precisions[cw * self.veclen..(cw + 1) * self.veclen]
    }

    #[inline]
    pub fn det(&self, cw: usize) -> Var {
        self.dets[cw]
    }
}

/// Raw contents of one mean or variance file.
#[derive(Debug, Clone)]
pub struct GaussianFile {
    pub n_density: usize,
    pub veclen: Vec<usize>,
    /// One `n_density * veclen[f]` array per stream.
    pub streams: Vec<Vec<f32>>,
}

impl GaussianFile {
    pub fn read(path: &Path) -> Result<Self> {
        info!("Reading S3 mixture gaussian file '{}'", path.display());
        let (mut r, header) = S3Reader::open(path)?;
        header.check_version(path, MGAU_PARAM_VERSION);

        let n_mgau = r.read_count("#codebooks")?;
        if n_mgau != 1 {
            return Err(ScoreError::format(path, format!("#codebooks ({n_mgau}) != 1")));
        }
        let n_feat = r.read_count("#features")?;
        if n_feat == 0 {
            return Err(ScoreError::format(path, "zero feature streams"));
        }
        let n_density = r.read_count("#density/codebook")?;
        let veclen = r.read_counts(n_feat, "feature vector-length")?;
        let blk = veclen
            .iter()
            .try_fold(0usize, |acc, &len| acc.checked_add(len))
            .ok_or_else(|| ScoreError::format(path, "feature vector lengths overflow"))?;
        let n = r.read_count("total #floats")?;
        if Some(n) != n_density.checked_mul(blk) {
            return Err(ScoreError::format(
                path,
                format!("#float32s ({n}) doesn't match dimensions: 1 x {n_density} x {blk}"),
            ));
        }
        r.ensure_available(n, 4, "gaussian parameters")?;

        let streams = veclen
            .iter()
            .enumerate()
            .map(|(f, &len)| r.read_f32_array(n_density * len, &format!("stream {f} data")))
            .collect::<Result<Vec<_>>>()?;

        if header.has_checksum() {
            r.verify_checksum()?;
        }
        r.expect_eof()?;

        info!(
            "1 mixture Gaussians, {} components, {} feature streams, veclen {}",
            n_density, n_feat, blk
        );
        Ok(Self {
            n_density,
            veclen,
            streams,
        })
    }

    /// One stream array of `n_density * veclen[f]` values per stream.
    fn check_shape(&self) -> Result<()> {
        if self.streams.len() != self.veclen.len() {
            return Err(ScoreError::DimensionMismatch {
                what: "feature stream count",
                expected: self.veclen.len(),
                found: self.streams.len(),
            });
        }
        for (stream, &len) in self.streams.iter().zip(&self.veclen) {
            let expected = self.n_density.checked_mul(len).ok_or_else(|| {
                ScoreError::Config(format!("{} x {len} gaussian parameters overflow", self.n_density))
            })?;
            if stream.len() != expected {
                return Err(ScoreError::DimensionMismatch {
                    what: "gaussian parameters per stream",
                    expected,
                    found: stream.len(),
                });
            }
        }
        Ok(())
    }

    /// Write in the same format, with a checksum.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut w = S3Writer::create(
            path,
            &[("version", MGAU_PARAM_VERSION)],
            true,
            ByteOrder::native(),
        )?;
        let blk: usize = self.veclen.iter().sum();
        w.write_i32(1)?;
        w.write_i32(to_i32(self.veclen.len())?)?;
        w.write_i32(to_i32(self.n_density)?)?;
        for &len in &self.veclen {
            w.write_i32(to_i32(len)?)?;
        }
        w.write_i32(to_i32(self.n_density * blk)?)?;
        for stream in &self.streams {
            w.write_f32_slice(stream)?;
        }
        w.finish()?;
        Ok(())
    }
}

fn to_i32(v: usize) -> Result<i32> {
    i32::try_from(v).map_err(|_| ScoreError::Config(format!("count {v} does not fit in 32 bits")))
}

/// All streams' codebooks.
#[derive(Debug, Clone)]
pub struct CodebookSet {
    n_density: usize,
    streams: Vec<Codebook>,
}

impl CodebookSet {
    /// Load a mean/variance pair and precompute precisions and determinants.
    ///
    /// `lmath` must be the full-resolution (shift 0) log domain.
    pub fn load(mean_path: &Path, var_path: &Path, var_floor: f32, lmath: &LogMath) -> Result<Self> {
        let means = GaussianFile::read(mean_path)?;
        let vars = GaussianFile::read(var_path)?;
        Self::from_files(&means, &vars, var_floor, lmath)
    }

    pub fn from_files(
        means: &GaussianFile,
        vars: &GaussianFile,
        var_floor: f32,
        lmath: &LogMath,
    ) -> Result<Self> {
        if vars.veclen.len() != means.veclen.len() {
            return Err(ScoreError::DimensionMismatch {
                what: "feature stream count",
                expected: means.veclen.len(),
                found: vars.veclen.len(),
            });
        }
        if vars.n_density != means.n_density {
            return Err(ScoreError::DimensionMismatch {
                what: "densities per stream",
                expected: means.n_density,
                found: vars.n_density,
            });
        }
        for (&m, &v) in means.veclen.iter().zip(&vars.veclen) {
            if m != v {
                return Err(ScoreError::DimensionMismatch {
                    what: "feature stream length",
                    expected: m,
                    found: v,
                });
            }
        }
        means.check_shape()?;
        vars.check_shape()?;

        let n_density = means.n_density;
        let two_pi = 2.0 * std::f64::consts::PI;
        let streams = means
            .veclen
            .iter()
            .zip(means.streams.iter().zip(&vars.streams))
            .map(|(&veclen, (m, v))| {
                let mut precisions = Vec::with_capacity(v.len());
                let mut dets = Vec::with_capacity(n_density);
                for cw_vars in v.chunks_exact(veclen.max(1)).take(n_density) {
                    let mut d: i64 = 0;
                    for &var in cw_vars {
                        let fvar = f64::from(var.max(var_floor));
                        d += i64::from(lmath.log(1.0 / (fvar * two_pi).sqrt()));
                        precisions.push(var_from_log(lmath.ln_to_log(1.0 / (2.0 * fvar))));
                    }
                    dets.push(var_from_log(d.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32));
                }
                if veclen == 0 {
                    dets.resize(n_density, var_from_log(0));
                }
                Codebook {
                    veclen,
                    means: m.iter().map(|&x| mean_from_f32(x)).collect(),
                    precisions,
                    dets,
                }
            })
            .collect::<Vec<_>>();

        debug!(n_streams = streams.len(), n_density, "codebooks precomputed");
        Ok(Self { n_density, streams })
    }

    pub fn n_feat(&self) -> usize {
        self.streams.len()
    }

    pub fn n_density(&self) -> usize {
        self.n_density
    }

    pub fn veclen(&self, feat: usize) -> usize {
        self.streams[feat].veclen
    }

    pub fn stream(&self, feat: usize) -> &Codebook {
        &self.streams[feat]
    }

    pub fn streams(&self) -> &[Codebook] {
        &self.streams
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lmath() -> LogMath {
        LogMath::new(crate::logmath::DEFAULT_LOG_BASE, 0, false).unwrap()
    }

    fn unit_file(n_density: usize, veclen: Vec<usize>, value: f32) -> GaussianFile {
        let streams = veclen.iter().map(|&l| vec![value; n_density * l]).collect();
        GaussianFile {
            n_density,
            veclen,
            streams,
        }
    }

    #[test]
    fn precompute_unit_variance() {
        let means = unit_file(2, vec![3], 0.0);
        let vars = unit_file(2, vec![3], 1.0);
        let cb = CodebookSet::from_files(&means, &vars, 0.0001, &lmath()).unwrap();
        let s = cb.stream(0);
        // log_1.0001(1/sqrt(2 pi)) truncates to -9189 per dimension.
        assert_eq!(s.det(0), var_from_log(3 * -9189));
        // 0.5 / ln(1.0001) truncates to 5000.
        assert_eq!(s.precision(1)[2], var_from_log(5000));
        assert_eq!(s.mean(1).len(), 3);
    }

    #[test]
    fn variance_is_floored() {
        let means = unit_file(1, vec![1], 0.0);
        let vars = unit_file(1, vec![1], 0.0);
        let floored = unit_file(1, vec![1], 0.5);
        let a = CodebookSet::from_files(&means, &vars, 0.5, &lmath()).unwrap();
        let b = CodebookSet::from_files(&means, &floored, 0.5, &lmath()).unwrap();
        assert_eq!(a.stream(0).det(0), b.stream(0).det(0));
        assert_eq!(a.stream(0).precision(0), b.stream(0).precision(0));
    }

    #[test]
    fn mismatched_files_are_rejected() {
        let means = unit_file(4, vec![2, 3], 0.0);
        let bad_len = unit_file(4, vec![2, 4], 1.0);
        let bad_density = unit_file(5, vec![2, 3], 1.0);
        let bad_streams = unit_file(4, vec![2], 1.0);
        for vars in [bad_len, bad_density, bad_streams] {
            assert!(matches!(
                CodebookSet::from_files(&means, &vars, 0.0001, &lmath()),
                Err(ScoreError::DimensionMismatch { .. })
            ));
        }
    }

    #[test]
    fn short_stream_arrays_are_rejected() {
        let means = unit_file(4, vec![2], 0.0);
        let mut vars = unit_file(4, vec![2], 1.0);
        vars.streams[0].truncate(7);
        assert!(matches!(
            CodebookSet::from_files(&means, &vars, 0.0001, &lmath()),
            Err(ScoreError::DimensionMismatch {
                what: "gaussian parameters per stream",
                expected: 8,
                found: 7,
            })
        ));
    }

    /// Header words only, no payload.
    fn write_header_only(path: &Path, words: &[i32]) {
        let mut w = S3Writer::create(
            path,
            &[("version", MGAU_PARAM_VERSION)],
            false,
            ByteOrder::native(),
        )
        .unwrap();
        for &v in words {
            w.write_i32(v).unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn huge_counts_in_truncated_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("means");

        write_header_only(&path, &[1, i32::MAX, 4]);
        assert!(matches!(
            GaussianFile::read(&path),
            Err(ScoreError::Truncated { .. })
        ));

        write_header_only(&path, &[1, 1, 1 << 24, 64, 1 << 30]);
        assert!(matches!(
            GaussianFile::read(&path),
            Err(ScoreError::Truncated { .. })
        ));
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("means");
        let mut file = unit_file(3, vec![2, 1], 0.0);
        file.streams[1] = vec![1.0, 2.0, 3.0];
        file.write(&path).unwrap();
        let back = GaussianFile::read(&path).unwrap();
        assert_eq!(back.n_density, 3);
        assert_eq!(back.veclen, vec![2, 1]);
        assert_eq!(back.streams[1], vec![1.0, 2.0, 3.0]);
    }
}

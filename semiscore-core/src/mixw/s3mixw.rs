//! Float mixture-weight (`mixw`) files.
//!
//! ```text
//! i32 n_sen, n_feat, n_comp, n_floats (== n_sen * n_feat * n_comp)
//! f32 [n_sen][n_feat][n_comp]
//! ```
//!
//! Rows are normalized, floored, renormalized and quantized to negated
//! 8-bit log values, then transposed to codeword-major order.

use std::path::Path;

use tracing::{error, info};

use super::MixtureWeights;
use crate::bio::{ByteOrder, S3Reader, S3Writer};
use crate::error::{Result, ScoreError};
use crate::logmath::{LogMath, MAX_NEG_MIXW};

pub const MGAU_MIXW_VERSION: &str = "1.0";

/// Normalize in place; returns the original sum. Non-positive sums leave
/// the row unchanged.
fn sum_norm(v: &mut [f32]) -> f32 {
    let sum: f32 = v.iter().sum();
    if sum > 0.0 {
        v.iter_mut().for_each(|x| *x /= sum);
    }
    sum
}

/// Read and quantize a `mixw` file.
///
/// `n_feat`/`n_density` come from the codebooks; `n_sen` is checked when
/// the caller knows it.
pub fn read_mixw(
    path: &Path,
    n_feat: usize,
    n_density: usize,
    n_sen: Option<usize>,
    mixw_floor: f32,
    lmath_8b: &LogMath,
) -> Result<MixtureWeights> {
    info!("Reading mixture weights file '{}'", path.display());
    let (mut r, header) = S3Reader::open(path)?;
    header.check_version(path, MGAU_MIXW_VERSION);

    let file_n_sen = r.read_count("#senones")?;
    let file_n_feat = r.read_count("#features")?;
    let n_comp = r.read_count("#codewords")?;
    let n = r.read_count("arraysize")?;

    if file_n_feat != n_feat {
        return Err(ScoreError::DimensionMismatch {
            what: "feature stream count",
            expected: n_feat,
            found: file_n_feat,
        });
    }
    if n_comp != n_density {
        return Err(ScoreError::DimensionMismatch {
            what: "codewords per stream",
            expected: n_density,
            found: n_comp,
        });
    }
    if let Some(expected) = n_sen {
        if expected != file_n_sen {
            return Err(ScoreError::DimensionMismatch {
                what: "senone count",
                expected,
                found: file_n_sen,
            });
        }
    }
    let n_sen = file_n_sen;
    if Some(n) != n_sen.checked_mul(n_feat).and_then(|x| x.checked_mul(n_comp)) {
        return Err(ScoreError::format(
            path,
            format!("#float32s ({n}) doesn't match header dimensions: {n_sen} x {n_feat} x {n_comp}"),
        ));
    }

    r.ensure_available(n, 4, "arraydata")?;
    let mut data = vec![0u8; n];
    let mut pdf = Vec::with_capacity(n_comp);
    let mut n_err = 0usize;
    for sen in 0..n_sen {
        for f in 0..n_feat {
            pdf.clear();
            r.read_f32_into(&mut pdf, n_comp, "arraydata")?;

            if sum_norm(&mut pdf) <= 0.0 {
                n_err += 1;
            }
            pdf.iter_mut().for_each(|p| *p = p.max(mixw_floor));
            sum_norm(&mut pdf);

            for (c, &p) in pdf.iter().enumerate() {
                let mut qscr = -lmath_8b.log(f64::from(p));
                if !(0..=MAX_NEG_MIXW).contains(&qscr) {
                    qscr = MAX_NEG_MIXW;
                }
                data[(f * n_comp + c) * n_sen + sen] = qscr as u8;
            }
        }
    }
    if n_err > 0 {
        error!("Weight normalization failed for {} senones", n_err);
    }

    if header.has_checksum() {
        r.verify_checksum()?;
    }
    r.expect_eof()?;

    info!("Read {} x {} x {} mixture weights", n_sen, n_feat, n_comp);
    MixtureWeights::dense(n_feat, n_density, n_sen, data)
}

/// Float mixture weights in file order, for writing `mixw` files.
#[derive(Debug, Clone)]
pub struct MixwFile {
    pub n_sen: usize,
    pub n_feat: usize,
    pub n_comp: usize,
    /// `[n_sen][n_feat][n_comp]`, flattened.
    pub data: Vec<f32>,
}

impl MixwFile {
    pub fn write(&self, path: &Path) -> Result<()> {
        let expected = self.n_sen * self.n_feat * self.n_comp;
        if self.data.len() != expected {
            return Err(ScoreError::DimensionMismatch {
                what: "mixture weight floats",
                expected,
                found: self.data.len(),
            });
        }
        let mut w = S3Writer::create(
            path,
            &[("version", MGAU_MIXW_VERSION)],
            true,
            ByteOrder::native(),
        )?;
        for v in [self.n_sen, self.n_feat, self.n_comp, expected] {
            let v = i32::try_from(v)
                .map_err(|_| ScoreError::Config(format!("count {v} does not fit in 32 bits")))?;
            w.write_i32(v)?;
        }
        w.write_f32_slice(&self.data)?;
        w.finish()?;
        Ok(())
    }
}

//! Mixture-weight store.
//!
//! Weights are negated 8-bit log probabilities of P(senone | codeword),
//! stored codeword-major: one row of senone weights per `(stream, codeword)`.
//!
//! ```text
//! Dense    row[sen]                       weight byte
//! Packed4  row[sen / 2] nibble            cluster id -> cluster[id]
//!          (even senone: low nibble, odd senone: high nibble)
//! Rle      runs of (len - 1) << 4 | id    cluster id -> cluster[id]
//! ```
//!
//! Row byte ranges are validated once at load time against the backing
//! buffer, which is either owned or a read-only memory map of the dump file.

pub mod rle;
pub mod s3mixw;
pub mod sendump;

use std::ops::Range;

use crate::error::{Result, ScoreError};

pub use s3mixw::{read_mixw, MixwFile, MGAU_MIXW_VERSION};
pub use sendump::{read_sendump, SendumpWriter};

/// Cluster table size for 4-bit and RLE weights.
pub const N_CLUSTER: usize = 16;

/// Backing bytes of a mixture-weight table.
pub enum ModelBytes {
    Owned(Vec<u8>),
    #[cfg(feature = "mmap")]
    Mapped(memmap2::Mmap),
}

impl ModelBytes {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            ModelBytes::Owned(v) => v,
            #[cfg(feature = "mmap")]
            ModelBytes::Mapped(m) => m,
        }
    }

    pub fn is_mapped(&self) -> bool {
        !matches!(self, ModelBytes::Owned(_))
    }
}

impl std::fmt::Debug for ModelBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelBytes::Owned(v) => write!(f, "ModelBytes::Owned({} bytes)", v.len()),
            #[cfg(feature = "mmap")]
            ModelBytes::Mapped(m) => write!(f, "ModelBytes::Mapped({} bytes)", m.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    Dense,
    Packed4,
    Rle,
}

#[derive(Debug)]
pub struct MixtureWeights {
    n_feat: usize,
    n_density: usize,
    n_sen: usize,
    layout: WeightLayout,
    cluster: Option<[u8; N_CLUSTER]>,
    bytes: ModelBytes,
    /// Indexed by `feat * n_density + codeword`.
    rows: Vec<Range<usize>>,
}

impl MixtureWeights {
    /// Assemble a table, checking every row range against `bytes`.
    pub(crate) fn new(
        n_feat: usize,
        n_density: usize,
        n_sen: usize,
        layout: WeightLayout,
        cluster: Option<[u8; N_CLUSTER]>,
        bytes: ModelBytes,
        rows: Vec<Range<usize>>,
    ) -> Result<Self> {
        if rows.len() != n_feat * n_density {
            return Err(ScoreError::DimensionMismatch {
                what: "mixture weight rows",
                expected: n_feat * n_density,
                found: rows.len(),
            });
        }
        if layout != WeightLayout::Dense && cluster.is_none() {
            return Err(ScoreError::Config(format!(
                "{layout:?} mixture weights need a cluster table"
            )));
        }
        let min_len = match layout {
            WeightLayout::Dense => n_sen,
            WeightLayout::Packed4 => n_sen.div_ceil(2),
            WeightLayout::Rle => 1,
        };
        let total = bytes.as_slice().len();
        for r in &rows {
            if r.start > r.end || r.end > total || (n_sen > 0 && r.len() < min_len) {
                return Err(ScoreError::Other(anyhow::anyhow!(
                    "mixture weight row {r:?} is outside the {total}-byte buffer"
                )));
            }
        }
        Ok(Self {
            n_feat,
            n_density,
            n_sen,
            layout,
            cluster,
            bytes,
            rows,
        })
    }

    /// Dense weights held in memory, rows of `n_sen` bytes laid out in
    /// `(feat, codeword)` order.
    pub fn dense(n_feat: usize, n_density: usize, n_sen: usize, data: Vec<u8>) -> Result<Self> {
        let rows = (0..n_feat * n_density)
            .map(|i| i * n_sen..(i + 1) * n_sen)
            .collect();
        Self::new(
            n_feat,
            n_density,
            n_sen,
            WeightLayout::Dense,
            None,
            ModelBytes::Owned(data),
            rows,
        )
    }

    pub fn n_feat(&self) -> usize {
        self.n_feat
    }

    pub fn n_density(&self) -> usize {
        self.n_density
    }

    pub fn n_sen(&self) -> usize {
        self.n_sen
    }

    pub fn layout(&self) -> WeightLayout {
        self.layout
    }

    pub fn cluster(&self) -> Option<&[u8; N_CLUSTER]> {
        self.cluster.as_ref()
    }

    pub fn is_mapped(&self) -> bool {
        self.bytes.is_mapped()
    }

    /// Raw bytes of one `(stream, codeword)` row.
    #[inline]
    pub fn row(&self, feat: usize, cw: usize) -> &[u8] {
        let r = &self.rows[feat * self.n_density + cw];
        &self.bytes.as_slice()[r.clone()]
    }

    /// Decoded weight of one senone, whatever the layout. Used by tooling
    /// and tests; the kernels read rows directly.
    pub fn weight(&self, feat: usize, cw: usize, sen: usize) -> u8 {
        let row = self.row(feat, cw);
        let cluster = self.cluster.unwrap_or([0; N_CLUSTER]);
        match self.layout {
            WeightLayout::Dense => row[sen],
            WeightLayout::Packed4 => cluster[usize::from(nibble(row, sen))],
            WeightLayout::Rle => {
                let mut end = 0;
                for (len, id) in rle::Runs::new(row) {
                    end += len;
                    if sen < end {
                        return cluster[usize::from(id)];
                    }
                }
                cluster[0]
            }
        }
    }
}

/// Cluster id of `sen` in a 4-bit packed row.
#[inline(always)]
pub fn nibble(row: &[u8], sen: usize) -> u8 {
    let b = row[sen / 2];
    if sen & 1 == 1 {
        b >> 4
    } else {
        b & 0x0f
    }
}

/// Pack cluster ids two per byte, even index in the low nibble.
pub fn pack_nibbles(ids: &[u8]) -> Vec<u8> {
    ids.chunks(2)
        .map(|pair| (pair[0] & 0x0f) | (pair.get(1).copied().unwrap_or(0) << 4))
        .collect()
}

#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
pub(crate) fn map_file(file: &std::fs::File) -> std::io::Result<memmap2::Mmap> {
    // SAFETY: the map is read-only; model files are not modified while loaded.
    unsafe { memmap2::Mmap::map(file) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibble_order_is_low_then_high() {
        let packed = pack_nibbles(&[1, 2, 3]);
        assert_eq!(packed, vec![0x21, 0x03]);
        assert_eq!(nibble(&packed, 0), 1);
        assert_eq!(nibble(&packed, 1), 2);
        assert_eq!(nibble(&packed, 2), 3);
    }

    #[test]
    fn weight_decodes_every_layout() {
        let cluster = {
            let mut c = [0u8; N_CLUSTER];
            for (i, v) in c.iter_mut().enumerate() {
                *v = (i * 10) as u8;
            }
            c
        };
        let ids = [2u8, 2, 5];

        let packed = pack_nibbles(&ids);
        let len = packed.len();
        let mw = MixtureWeights::new(
            1,
            1,
            3,
            WeightLayout::Packed4,
            Some(cluster),
            ModelBytes::Owned(packed),
            vec![0..len],
        )
        .unwrap();
        assert_eq!(mw.weight(0, 0, 2), 50);

        let runs = rle::encode_row(&ids);
        let len = runs.len();
        let mw = MixtureWeights::new(
            1,
            1,
            3,
            WeightLayout::Rle,
            Some(cluster),
            ModelBytes::Owned(runs),
            vec![0..len],
        )
        .unwrap();
        assert_eq!(mw.weight(0, 0, 1), 20);
        assert_eq!(mw.weight(0, 0, 2), 50);

        let mw = MixtureWeights::dense(1, 2, 2, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(mw.weight(0, 1, 0), 3);
        assert!(!mw.is_mapped());
    }

    #[test]
    fn out_of_bounds_rows_are_rejected() {
        let err = MixtureWeights::new(
            1,
            1,
            4,
            WeightLayout::Dense,
            None,
            ModelBytes::Owned(vec![0; 3]),
            vec![0..4],
        );
        assert!(err.is_err());
        let err = MixtureWeights::new(
            1,
            1,
            4,
            WeightLayout::Packed4,
            None,
            ModelBytes::Owned(vec![0; 2]),
            vec![0..2],
        );
        assert!(matches!(err, Err(ScoreError::Config(_))));
    }
}

//! Binary senone dump (`sendump`) files.
//!
//! ```text
//! i32 len, title[len]           (NUL-terminated; len in 1..=999 picks byte order)
//! i32 len, header[len]          (NUL-terminated)
//! { i32 len, "key value\0" }    until len == 0
//!   keys: feature_count mixture_count model_count
//!         cluster_count cluster_bits rle_bits
//! [i32 rows, i32 cols]          only when cluster_count is 0
//! [u8 cluster[16]]              when cluster_count is 15 or 16
//! rows, (feat, codeword) order:
//!   dense 8-bit   n_sen bytes
//!   packed 4-bit  (n_sen + 1) / 2 bytes
//!   RLE           runs expanding to exactly n_sen
//! ```

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::ops::Range;
use std::path::Path;

use tracing::{debug, info, warn};

use super::rle::{encode_row, measure_row};
use super::{pack_nibbles, MixtureWeights, ModelBytes, WeightLayout, N_CLUSTER};
use crate::bio::ByteOrder;
use crate::error::{Result, ScoreError};
use crate::logmath::MAX_NEG_MIXW;
use crate::model::MAX_SENONES;

const MAX_TITLE_LEN: u32 = 999;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
    path: &'a Path,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| ScoreError::truncated(self.path, format!("cannot read {what}")))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn word(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(self.order.u32_from([b[0], b[1], b[2], b[3]]))
    }

    fn len(&mut self, what: &str) -> Result<usize> {
        let v = self.word(what)? as i32;
        usize::try_from(v)
            .map_err(|_| ScoreError::format(self.path, format!("negative {what} length {v}")))
    }

    /// A length-prefixed string that must end in NUL.
    fn terminated_string(&mut self, what: &str) -> Result<String> {
        let n = self.len(what)?;
        let raw = self.take(n, what)?;
        match raw.split_last() {
            Some((0, body)) => Ok(String::from_utf8_lossy(body).into_owned()),
            _ => Err(ScoreError::format(self.path, format!("bad {what} in dump file"))),
        }
    }
}

/// Leading integer of `s`, 0 when there is none.
fn atoi(s: &str) -> i64 {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().map(|v| sign * v).unwrap_or(0)
}

#[derive(Debug)]
struct Layout {
    kind: WeightLayout,
    n_sen: usize,
    cluster: Option<[u8; N_CLUSTER]>,
    rows: Vec<Range<usize>>,
}

fn parse(
    buf: &[u8],
    path: &Path,
    n_feat: usize,
    n_density: usize,
    n_sen: Option<usize>,
) -> Result<Layout> {
    let mut cur = Cursor {
        buf,
        pos: 0,
        order: ByteOrder::native(),
        path,
    };

    let raw = cur.word("title length")?;
    if !(1..=MAX_TITLE_LEN).contains(&raw) {
        let swapped = raw.swap_bytes();
        if !(1..=MAX_TITLE_LEN).contains(&swapped) {
            return Err(ScoreError::format(
                path,
                format!("title length {raw:#x} out of range"),
            ));
        }
        cur.order = match cur.order {
            ByteOrder::Little => ByteOrder::Big,
            ByteOrder::Big => ByteOrder::Little,
        };
    }
    cur.pos = 0;
    let title = cur.terminated_string("title")?;
    info!("{}", title);
    let _header = cur.terminated_string("header")?;

    let mut file_feat = n_feat as i64;
    let mut file_density = n_density as i64;
    let mut file_sen = n_sen.map(|n| n as i64);
    let mut n_clust = 0i64;
    let mut n_bits = 8i64;
    let mut rle_bits = 0i64;
    loop {
        let n = cur.len("header string")?;
        if n == 0 {
            break;
        }
        let raw = cur.take(n, "header string")?;
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\0');
        let Some((key, value)) = line.split_once(' ') else {
            debug!(line, "ignoring sendump header string");
            continue;
        };
        match key {
            "feature_count" => file_feat = atoi(value),
            "mixture_count" => file_density = atoi(value),
            "model_count" => file_sen = Some(atoi(value)),
            "cluster_count" => n_clust = atoi(value),
            "cluster_bits" => n_bits = atoi(value),
            "rle_bits" => rle_bits = atoi(value),
            _ => debug!(key, value, "ignoring sendump header key"),
        }
    }

    if n_clust == 0 {
        let r = cur.word("#rows")? as i32;
        let c = cur.word("#columns")? as i32;
        info!("Rows: {}, Columns: {}", r, c);
    }

    let check = |what: &'static str, expected: usize, found: i64| -> Result<()> {
        if found != expected as i64 {
            return Err(ScoreError::DimensionMismatch {
                what,
                expected,
                found: usize::try_from(found).unwrap_or(0),
            });
        }
        Ok(())
    };
    check("feature stream count", n_feat, file_feat)?;
    check("densities per stream", n_density, file_density)?;
    let n_sen = match (n_sen, file_sen) {
        (Some(expected), Some(found)) => {
            check("senone count", expected, found)?;
            expected
        }
        (None, Some(found)) => usize::try_from(found)
            .map_err(|_| ScoreError::format(path, format!("bad model_count {found}")))?,
        (_, None) => {
            return Err(ScoreError::format(
                path,
                "no model_count in dump and no expected senone count",
            ))
        }
    };
    if n_sen > MAX_SENONES {
        return Err(ScoreError::format(
            path,
            format!("model_count {n_sen} exceeds the limit of {MAX_SENONES}"),
        ));
    }

    if !matches!(n_clust, 0 | 15 | 16) {
        return Err(ScoreError::format(path, "cluster count must be 0, 15, or 16"));
    }
    if !matches!(n_bits, 4 | 8) {
        return Err(ScoreError::format(path, "cluster bits must be 4 or 8"));
    }

    let cluster = if n_clust > 0 {
        let raw = cur.take(N_CLUSTER, "cluster table")?;
        let mut table = [0u8; N_CLUSTER];
        table.copy_from_slice(raw);
        Some(table)
    } else {
        None
    };

    let n_rows = n_feat
        .checked_mul(n_density)
        .ok_or_else(|| ScoreError::format(path, "mixture weight row count overflows"))?;
    let mut rows = Vec::with_capacity(n_rows.min(buf.len() - cur.pos));
    let kind = if rle_bits != 0 {
        if cluster.is_none() {
            return Err(ScoreError::format(path, "RLE mixture weights without a cluster table"));
        }
        for f in 0..n_feat {
            for c in 0..n_density {
                let rest = &buf[cur.pos..];
                let (used, covered) = measure_row(rest, n_sen);
                if covered != n_sen {
                    return Err(ScoreError::RleInconsistent {
                        path: path.to_path_buf(),
                        stream: f,
                        codeword: c,
                        expected: n_sen,
                        found: covered,
                    });
                }
                rows.push(cur.pos..cur.pos + used);
                cur.pos += used;
            }
        }
        WeightLayout::Rle
    } else {
        let (kind, step) = if n_bits == 4 {
            if cluster.is_none() {
                return Err(ScoreError::Config(format!(
                    "{}: 4-bit mixture weights without a cluster table",
                    path.display()
                )));
            }
            (WeightLayout::Packed4, n_sen.div_ceil(2))
        } else {
            if cluster.is_some() {
                warn!("8-bit mixture weights with a cluster table; table ignored");
            }
            (WeightLayout::Dense, n_sen)
        };
        let left = buf.len() - cur.pos;
        let need = step
            .checked_mul(n_rows)
            .filter(|&need| need <= left)
            .ok_or_else(|| {
                ScoreError::truncated(
                    path,
                    format!("need {n_rows} rows of {step} bytes of mixture weights, found {left} bytes"),
                )
            })?;
        for i in 0..n_rows {
            rows.push(cur.pos + i * step..cur.pos + (i + 1) * step);
        }
        cur.pos += need;
        kind
    };
    if cur.pos != buf.len() {
        debug!(extra = buf.len() - cur.pos, "unused bytes after mixture weights");
    }

    Ok(Layout {
        kind,
        n_sen,
        cluster: if kind == WeightLayout::Dense { None } else { cluster },
        rows,
    })
}

fn load_bytes(path: &Path, use_mmap: bool) -> Result<ModelBytes> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ScoreError::ModelNotFound {
            path: path.to_path_buf(),
        },
        _ => ScoreError::Io(e),
    })?;
    #[cfg(feature = "mmap")]
    if use_mmap {
        info!("Using memory-mapped I/O for senones");
        return Ok(ModelBytes::Mapped(super::map_file(&file)?));
    }
    #[cfg(not(feature = "mmap"))]
    if use_mmap {
        debug!("mmap feature disabled; reading senones into memory");
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(ModelBytes::Owned(buf))
}

/// Load a dump. `n_feat`/`n_density` come from the codebooks; `n_sen` is
/// checked against `model_count` when known.
pub fn read_sendump(
    path: &Path,
    n_feat: usize,
    n_density: usize,
    n_sen: Option<usize>,
    use_mmap: bool,
) -> Result<MixtureWeights> {
    info!("Loading senones from dump file {}", path.display());
    let mut bytes = load_bytes(path, use_mmap)?;
    let layout = parse(bytes.as_slice(), path, n_feat, n_density, n_sen)?;

    if layout.kind == WeightLayout::Dense {
        if let ModelBytes::Owned(buf) = &mut bytes {
            let mut clamped = 0usize;
            for r in &layout.rows {
                for w in &mut buf[r.clone()] {
                    if i32::from(*w) > MAX_NEG_MIXW {
                        *w = MAX_NEG_MIXW as u8;
                        clamped += 1;
                    }
                }
            }
            if clamped > 0 {
                warn!(clamped, "mixture weights above {} clamped", MAX_NEG_MIXW);
            }
        }
    }

    info!(
        layout = ?layout.kind,
        n_feat,
        n_density,
        n_sen = layout.n_sen,
        mapped = bytes.is_mapped(),
        "mixture weights loaded"
    );
    MixtureWeights::new(
        n_feat,
        n_density,
        layout.n_sen,
        layout.kind,
        layout.cluster,
        bytes,
        layout.rows,
    )
}

/// Writes `sendump` files in any of the three layouts.
#[derive(Debug, Clone)]
pub struct SendumpWriter {
    pub title: String,
    pub n_feat: usize,
    pub n_density: usize,
    pub n_sen: usize,
    pub layout: WeightLayout,
    /// Required for `Packed4` and `Rle`; written but unused for `Dense`.
    pub cluster: Option<[u8; N_CLUSTER]>,
    pub byte_order: ByteOrder,
}

impl SendumpWriter {
    pub fn new(n_feat: usize, n_density: usize, n_sen: usize) -> Self {
        Self {
            title: "semiscore senone dump".into(),
            n_feat,
            n_density,
            n_sen,
            layout: WeightLayout::Dense,
            cluster: None,
            byte_order: ByteOrder::native(),
        }
    }

    /// `rows` holds one entry per `(feat, codeword)`, each `n_sen` long:
    /// weights for `Dense`, cluster ids for `Packed4` and `Rle`.
    pub fn write(&self, path: &Path, rows: &[Vec<u8>]) -> Result<()> {
        let mut out = Vec::new();
        self.encode(&mut out, rows)?;
        let mut file = File::create(path)?;
        file.write_all(&out)?;
        file.flush()?;
        Ok(())
    }

    pub fn encode(&self, out: &mut Vec<u8>, rows: &[Vec<u8>]) -> Result<()> {
        if rows.len() != self.n_feat * self.n_density {
            return Err(ScoreError::DimensionMismatch {
                what: "mixture weight rows",
                expected: self.n_feat * self.n_density,
                found: rows.len(),
            });
        }
        if let Some(bad) = rows.iter().find(|r| r.len() != self.n_sen) {
            return Err(ScoreError::DimensionMismatch {
                what: "mixture weight row length",
                expected: self.n_sen,
                found: bad.len(),
            });
        }
        if self.layout != WeightLayout::Dense && self.cluster.is_none() {
            return Err(ScoreError::Config(format!(
                "{:?} dumps need a cluster table",
                self.layout
            )));
        }

        let order = self.byte_order;
        let put_i32 = |out: &mut Vec<u8>, v: usize| -> Result<()> {
            let v = u32::try_from(v)
                .map_err(|_| ScoreError::Config(format!("value {v} does not fit in 32 bits")))?;
            out.extend_from_slice(&order.u32_to(v));
            Ok(())
        };
        let put_str = |out: &mut Vec<u8>, s: &str| -> Result<()> {
            put_i32(out, s.len() + 1)?;
            out.extend_from_slice(s.as_bytes());
            out.push(0);
            Ok(())
        };

        put_str(out, &self.title)?;
        put_str(out, "semiscore")?;
        put_str(out, &format!("feature_count {}", self.n_feat))?;
        put_str(out, &format!("mixture_count {}", self.n_density))?;
        put_str(out, &format!("model_count {}", self.n_sen))?;
        if self.cluster.is_some() {
            let bits = if self.layout == WeightLayout::Dense { 8 } else { 4 };
            put_str(out, &format!("cluster_count {N_CLUSTER}"))?;
            put_str(out, &format!("cluster_bits {bits}"))?;
        }
        if self.layout == WeightLayout::Rle {
            put_str(out, "rle_bits 4")?;
        }
        put_i32(out, 0)?;
        match self.cluster {
            Some(table) => out.extend_from_slice(&table),
            None => {
                put_i32(out, self.n_density)?;
                put_i32(out, self.n_sen)?;
            }
        }

        for row in rows {
            match self.layout {
                WeightLayout::Dense => out.extend_from_slice(row),
                WeightLayout::Packed4 => out.extend(pack_nibbles(row)),
                WeightLayout::Rle => out.extend(encode_row(row)),
            }
        }
        Ok(())
    }
}

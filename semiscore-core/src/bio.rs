//! Sphinx-3 binary model container.
//!
//! ```text
//! s3\n
//! <name> <value>\n        (any number; lines starting with '#' are comments)
//! endhdr\n
//! [4B byte-order magic 0x11223344 in file byte order]
//! [payload: 32-bit ints / floats in file byte order]
//! [4B checksum, present iff a `chksum0` argument was written]
//! ```
//!
//! A header whose first line is not `s3` is a legacy header: its first word
//! is the version and it carries no other arguments.
//!
//! The checksum is accumulated over payload elements *after* byte-order
//! correction, so it is independent of the file's endianness.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, ScoreError};

pub const BYTE_ORDER_MAGIC: u32 = 0x1122_3344;

/// Header lines longer than this are rejected.
const MAX_HEADER_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    pub fn u32_from(self, b: [u8; 4]) -> u32 {
        match self {
            ByteOrder::Little => u32::from_le_bytes(b),
            ByteOrder::Big => u32::from_be_bytes(b),
        }
    }

    pub fn i32_from(self, b: [u8; 4]) -> i32 {
        self.u32_from(b) as i32
    }

    pub fn u32_to(self, v: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }
}

/// Payload bytes read per `read_exact` call.
const READ_CHUNK: usize = 4096;

/// Fold one 32-bit element (host order) into the checksum.
#[inline]
fn fold_u32(sum: u32, v: u32) -> u32 {
    sum.rotate_left(20).wrapping_add(v)
}

/// Parsed `name value` header arguments.
#[derive(Debug, Clone)]
pub struct S3Header {
    pub args: Vec<(String, String)>,
    pub byte_order: ByteOrder,
}

impl S3Header {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn version(&self) -> Option<&str> {
        self.get("version")
    }

    /// A trailing checksum word follows the payload.
    pub fn has_checksum(&self) -> bool {
        self.get("chksum0").is_some()
    }

    /// Warn (but continue) when the version differs from `expected`.
    pub fn check_version(&self, path: &Path, expected: &str) {
        match self.version() {
            Some(v) if v == expected => {}
            Some(v) => warn!("version mismatch({}): {}, expecting {}", path.display(), v, expected),
            None => warn!("no version in header of {}", path.display()),
        }
    }
}

/// Reads a Sphinx-3 binary file: header, then checksummed payload.
pub struct S3Reader<R> {
    inner: R,
    path: PathBuf,
    byte_order: ByteOrder,
    checksum: u32,
    /// Bytes consumed so far, header included.
    consumed: u64,
    /// Total file length, when known.
    len: Option<u64>,
}

impl S3Reader<BufReader<File>> {
    /// Open `path` and parse its header. Counts read later are checked
    /// against the file length before anything is allocated for them.
    pub fn open(path: &Path) -> Result<(Self, S3Header)> {
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ScoreError::ModelNotFound {
                path: path.to_path_buf(),
            },
            _ => ScoreError::Io(e),
        })?;
        let len = file.metadata()?.len();
        let (mut reader, header) = Self::from_reader(BufReader::new(file), path)?;
        reader.len = Some(len);
        Ok((reader, header))
    }
}

impl<R: BufRead> S3Reader<R> {
    /// Parse the header from `inner`. `path` is used for error messages only.
    pub fn from_reader(mut inner: R, path: &Path) -> Result<(Self, S3Header)> {
        let mut args = Vec::new();
        let first = read_header_line(&mut inner, path)?;
        let mut consumed = first.len() as u64;

        if first.trim_end_matches(['\n', '\r']) == "s3" {
            loop {
                let line = read_header_line(&mut inner, path)?;
                consumed += line.len() as u64;
                let mut words = line.split_whitespace();
                let Some(name) = words.next() else {
                    return Err(ScoreError::format(path, "empty header line"));
                };
                if name == "endhdr" {
                    break;
                }
                if name.starts_with('#') {
                    continue;
                }
                let Some(value) = words.next() else {
                    return Err(ScoreError::format(
                        path,
                        format!("header argument '{name}' has no value"),
                    ));
                };
                args.push((name.to_string(), value.to_string()));
            }
        } else {
            let Some(version) = first.split_whitespace().next() else {
                return Err(ScoreError::format(path, "empty legacy header"));
            };
            args.push(("version".to_string(), version.to_string()));
        }

        let mut magic = [0u8; 4];
        inner
            .read_exact(&mut magic)
            .map_err(|e| map_read_err(e, path, "byte-order magic"))?;
        consumed += magic.len() as u64;
        let byte_order = if u32::from_le_bytes(magic) == BYTE_ORDER_MAGIC {
            ByteOrder::Little
        } else if u32::from_be_bytes(magic) == BYTE_ORDER_MAGIC {
            ByteOrder::Big
        } else {
            return Err(ScoreError::format(
                path,
                format!("cannot determine byte order from magic {magic:02x?}"),
            ));
        };
        debug!(path = %path.display(), ?byte_order, n_args = args.len(), "read s3 header");

        let header = S3Header { args, byte_order };
        Ok((
            Self {
                inner,
                path: path.to_path_buf(),
                byte_order,
                checksum: 0,
                consumed,
                len: None,
            },
            header,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Checksum accumulated over everything read so far.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Bytes left in the file, when its length is known.
    pub fn remaining(&self) -> Option<u64> {
        self.len.map(|len| len.saturating_sub(self.consumed))
    }

    /// Byte size of `n` elements of `el_size` bytes, or `Truncated` when the
    /// file cannot hold them.
    pub fn ensure_available(&self, n: usize, el_size: usize, what: &str) -> Result<usize> {
        let bytes = n.checked_mul(el_size).ok_or_else(|| {
            ScoreError::truncated(&self.path, format!("{n} elements of {what} overflow"))
        })?;
        match self.remaining() {
            Some(left) if bytes as u64 > left => Err(ScoreError::truncated(
                &self.path,
                format!("{what} needs {bytes} bytes, {left} left"),
            )),
            _ => Ok(bytes),
        }
    }

    fn read_word(&mut self, what: &str) -> Result<u32> {
        let mut b = [0u8; 4];
        self.inner
            .read_exact(&mut b)
            .map_err(|e| map_read_err(e, &self.path, what))?;
        self.consumed += 4;
        Ok(self.byte_order.u32_from(b))
    }

    pub fn read_i32(&mut self, what: &str) -> Result<i32> {
        let v = self.read_word(what)?;
        self.checksum = fold_u32(self.checksum, v);
        Ok(v as i32)
    }

    /// Read a non-negative count.
    pub fn read_count(&mut self, what: &str) -> Result<usize> {
        let v = self.read_i32(what)?;
        usize::try_from(v)
            .map_err(|_| ScoreError::format(&self.path, format!("negative {what}: {v}")))
    }

    /// Read `n` non-negative counts.
    pub fn read_counts(&mut self, n: usize, what: &str) -> Result<Vec<usize>> {
        self.ensure_available(n, 4, what)?;
        (0..n).map(|_| self.read_count(what)).collect()
    }

    pub fn read_f32_array(&mut self, n: usize, what: &str) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        self.read_f32_into(&mut out, n, what)?;
        Ok(out)
    }

    /// Append `n` floats to `out`, reusing its allocation.
    ///
    /// With an unknown file length the buffer grows only as data arrives.
    pub fn read_f32_into(&mut self, out: &mut Vec<f32>, n: usize, what: &str) -> Result<()> {
        let bytes = self.ensure_available(n, 4, what)?;
        if self.len.is_some() {
            out.reserve(n);
        }
        let mut raw = [0u8; READ_CHUNK];
        let mut left = bytes;
        while left > 0 {
            let k = left.min(READ_CHUNK);
            self.inner
                .read_exact(&mut raw[..k])
                .map_err(|e| map_read_err(e, &self.path, what))?;
            for c in raw[..k].chunks_exact(4) {
                let v = self.byte_order.u32_from([c[0], c[1], c[2], c[3]]);
                self.checksum = fold_u32(self.checksum, v);
                out.push(f32::from_bits(v));
            }
            left -= k;
        }
        self.consumed += bytes as u64;
        Ok(())
    }

    /// Compare the trailing checksum word against the accumulated value.
    pub fn verify_checksum(&mut self) -> Result<()> {
        let computed = self.checksum;
        let stored = self.read_word("checksum")?;
        if stored != computed {
            return Err(ScoreError::Checksum {
                path: self.path.clone(),
                expected: stored,
                found: computed,
            });
        }
        Ok(())
    }

    /// Fail if any byte remains.
    pub fn expect_eof(&mut self) -> Result<()> {
        let mut b = [0u8; 1];
        loop {
            match self.inner.read(&mut b) {
                Ok(0) => return Ok(()),
                Ok(_) => {
                    return Err(ScoreError::TrailingData {
                        path: self.path.clone(),
                    })
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ScoreError::Io(e)),
            }
        }
    }
}

fn read_header_line<R: BufRead>(r: &mut R, path: &Path) -> Result<String> {
    let mut raw = Vec::new();
    let n = r
        .by_ref()
        .take(MAX_HEADER_LINE as u64)
        .read_until(b'\n', &mut raw)?;
    if n == 0 {
        return Err(ScoreError::truncated(path, "premature end of header"));
    }
    if raw.last() != Some(&b'\n') {
        return Err(ScoreError::format(path, "unterminated or overlong header line"));
    }
    String::from_utf8(raw).map_err(|_| ScoreError::format(path, "header is not valid UTF-8"))
}

fn map_read_err(e: std::io::Error, path: &Path, what: &str) -> ScoreError {
    if e.kind() == ErrorKind::UnexpectedEof {
        ScoreError::truncated(path, format!("failed to read {what}"))
    } else {
        ScoreError::Io(e)
    }
}

/// Writes a Sphinx-3 binary file. Used by model tooling and tests.
pub struct S3Writer<W: Write> {
    inner: W,
    byte_order: ByteOrder,
    checksum: Option<u32>,
}

impl S3Writer<BufWriter<File>> {
    pub fn create(
        path: &Path,
        args: &[(&str, &str)],
        with_checksum: bool,
        byte_order: ByteOrder,
    ) -> Result<Self> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), args, with_checksum, byte_order)
    }
}

impl<W: Write> S3Writer<W> {
    pub fn new(
        mut inner: W,
        args: &[(&str, &str)],
        with_checksum: bool,
        byte_order: ByteOrder,
    ) -> Result<Self> {
        inner.write_all(b"s3\n")?;
        for (name, value) in args {
            writeln!(inner, "{name} {value}")?;
        }
        if with_checksum {
            inner.write_all(b"chksum0 yes\n")?;
        }
        inner.write_all(b"endhdr\n")?;
        inner.write_all(&byte_order.u32_to(BYTE_ORDER_MAGIC))?;
        Ok(Self {
            inner,
            byte_order,
            checksum: with_checksum.then_some(0),
        })
    }

    fn write_word(&mut self, v: u32) -> Result<()> {
        self.inner.write_all(&self.byte_order.u32_to(v))?;
        if let Some(sum) = self.checksum.as_mut() {
            *sum = fold_u32(*sum, v);
        }
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_word(v as u32)
    }

    pub fn write_f32_slice(&mut self, vals: &[f32]) -> Result<()> {
        for &v in vals {
            self.write_word(v.to_bits())?;
        }
        Ok(())
    }

    /// Append the checksum (if enabled), flush, and return the sink.
    pub fn finish(mut self) -> Result<W> {
        if let Some(sum) = self.checksum {
            self.inner.write_all(&self.byte_order.u32_to(sum))?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

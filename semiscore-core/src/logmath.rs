//! Integer log-domain arithmetic.
//!
//! Probabilities are represented as `log_base(p) >> shift`. Two objects are
//! used by the scorer:
//!
//! - a full-resolution domain (shift 0) for codeword determinants and
//!   variance scaling, and
//! - an 8-bit domain (shift [`SENSCR_SHIFT`]) whose add table fits in one
//!   byte per entry. [`FastLogAdd`] works on *negated* values of this domain
//!   and needs no sign checks, which is what makes the per-senone kernels
//!   cheap.
//!
//! ## Bounds
//!
//! Negated mixture weights are kept in `[0, MAX_NEG_MIXW]` and normalized
//! codeword scores in `[0, MAX_NEG_ASCR]`, so a single weight + score term
//! never exceeds 255 and the difference of two terms always indexes the
//! 256-entry table.

use crate::error::{Result, ScoreError};

/// Shift applied to full-resolution log values to reach the 8-bit domain.
pub const SENSCR_SHIFT: u32 = 10;

/// Maximum negated quantized mixture weight.
pub const MAX_NEG_MIXW: i32 = 159;

/// Maximum negated normalized acoustic score.
pub const MAX_NEG_ASCR: i32 = 96;

/// Default log base used by Sphinx-family acoustic models.
pub const DEFAULT_LOG_BASE: f64 = 1.0001;

/// Log-base conversion plus an optional add table.
#[derive(Debug, Clone)]
pub struct LogMath {
    base: f64,
    log_of_base: f64,
    inv_log_of_base: f64,
    shift: u32,
    zero: i32,
    /// Bytes per table entry needed to hold the largest entry (1, 2 or 4).
    width: usize,
    /// Indexed by the (shifted) difference of the two operands.
    table: Vec<u32>,
}

impl LogMath {
    /// Create a log domain with the given base and shift.
    ///
    /// When `use_table` is false no add table is built and [`LogMath::add`]
    /// falls back to exact arithmetic.
    pub fn new(base: f64, shift: u32, use_table: bool) -> Result<Self> {
        if !(base > 1.0) || !base.is_finite() {
            return Err(ScoreError::Config(format!(
                "log base must be finite and > 1, got {base}"
            )));
        }
        if shift > 24 {
            return Err(ScoreError::Config(format!("log shift {shift} is too large")));
        }

        let log_of_base = base.ln();
        let mut lmath = Self {
            base,
            log_of_base,
            inv_log_of_base: 1.0 / log_of_base,
            shift,
            zero: i32::MIN >> (shift + 2),
            width: 0,
            table: Vec::new(),
        };
        if use_table {
            lmath.build_table();
        }
        Ok(lmath)
    }

    fn build_table(&mut self) {
        let shift = self.shift;
        let inv_log_of_base = self.inv_log_of_base;
        let half = 0.5 * f64::from(1u32 << shift);
        let maxyx = ((2.0f64.ln() * inv_log_of_base + 0.5) as u32) >> shift;
        self.width = if maxyx < 256 {
            1
        } else if maxyx < 65_536 {
            2
        } else {
            4
        };

        // log_base(1 + base^-i), rounded into the shifted domain, for every
        // unshifted difference i until it rounds to zero.
        let entry = |byx: f64| {
            let lobyx = (1.0 + byx).ln() * inv_log_of_base;
            ((lobyx + half) as i64 >> shift) as i32
        };

        let mut byx = 1.0f64;
        let mut i: usize = 0;
        while entry(byx) > 0 {
            byx /= self.base;
            i += 1;
        }
        let size = (i >> shift).max(255) + 1;
        let mut table = vec![0u32; size];

        let mut byx = 1.0f64;
        let mut i: usize = 0;
        loop {
            let k = entry(byx);
            if let Some(slot) = table.get_mut(i >> shift) {
                // With a shift, several differences share a slot; keep the first.
                if *slot == 0 && k > 0 {
                    *slot = k as u32;
                }
            }
            if k <= 0 {
                break;
            }
            byx /= self.base;
            i += 1;
        }
        self.table = table;
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Bytes needed per add-table entry (0 when no table was built).
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn table(&self) -> &[u32] {
        &self.table
    }

    /// The value representing probability zero (and anything below it).
    pub fn zero(&self) -> i32 {
        self.zero
    }

    /// `log_base(p)` in this domain. Non-positive `p` maps to [`LogMath::zero`].
    pub fn log(&self, p: f64) -> i32 {
        if p <= 0.0 {
            return self.zero;
        }
        ((p.ln() * self.inv_log_of_base) as i32) >> self.shift
    }

    /// Convert a natural logarithm into this domain.
    pub fn ln_to_log(&self, log_p: f64) -> i32 {
        ((log_p * self.inv_log_of_base) as i32) >> self.shift
    }

    /// Probability represented by a value of this domain.
    pub fn exp(&self, logb_p: i32) -> f64 {
        self.base
            .powf(f64::from(logb_p) * f64::from(1u32 << self.shift))
    }

    /// Natural log of a value of this domain.
    pub fn log_to_ln(&self, logb_p: i32) -> f64 {
        f64::from(logb_p) * f64::from(1u32 << self.shift) * self.log_of_base
    }

    /// `log(exp(x) + exp(y))` computed in floating point.
    pub fn add_exact(&self, logb_x: i32, logb_y: i32) -> i32 {
        self.log(self.exp(logb_x) + self.exp(logb_y))
    }

    /// `log(exp(x) + exp(y))` for (positive-domain) log probabilities.
    ///
    /// Uses the add table when present; differences beyond the table return
    /// the larger operand unchanged.
    pub fn add(&self, logb_x: i32, logb_y: i32) -> i32 {
        if logb_x <= self.zero {
            return logb_y;
        }
        if logb_y <= self.zero {
            return logb_x;
        }
        if self.table.is_empty() {
            return self.add_exact(logb_x, logb_y);
        }

        let (d, r) = if logb_x > logb_y {
            (i64::from(logb_x) - i64::from(logb_y), logb_x)
        } else {
            (i64::from(logb_y) - i64::from(logb_x), logb_y)
        };
        match usize::try_from(d).ok().and_then(|d| self.table.get(d)) {
            Some(&t) => r.saturating_add(t as i32),
            None => r,
        }
    }
}

/// Add table for negated 8-bit log probabilities.
///
/// Built from a [`LogMath`] whose table entries all fit in one byte.
#[derive(Debug, Clone)]
pub struct FastLogAdd {
    table: Vec<u8>,
}

impl FastLogAdd {
    /// # Errors
    /// [`ScoreError::LogTableTooWide`] if `lmath` has no table or its entries
    /// do not fit in 8 bits.
    pub fn from_logmath(lmath: &LogMath) -> Result<Self> {
        if lmath.width() != 1 {
            return Err(ScoreError::LogTableTooWide { base: lmath.base() });
        }
        let table = lmath
            .table()
            .iter()
            .map(|&t| u8::try_from(t).map_err(|_| ScoreError::LogTableTooWide { base: lmath.base() }))
            .collect::<Result<Vec<u8>>>()?;
        Ok(Self { table })
    }

    /// `-log(exp(-mlx) + exp(-mly))` for negated log probabilities.
    ///
    /// Differences past the end of the table contribute nothing, which is
    /// the limit of the exact expression.
    #[inline(always)]
    pub fn add(&self, mlx: i32, mly: i32) -> i32 {
        let (d, r) = if mlx > mly {
            (mlx - mly, mly)
        } else {
            (mly - mlx, mlx)
        };
        r - i32::from(self.table.get(d as usize).copied().unwrap_or(0))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

//! Numeric representation of means, precisions and observations.
//!
//! The default build keeps everything in `f32`. With the `fixed-point`
//! feature, means and observations become Q(`RADIX`) integers, precisions
//! and determinants stay integer log values, and subtraction saturates
//! instead of wrapping.

#[cfg(not(feature = "fixed-point"))]
mod imp {
    /// Codeword mean / observation component.
    pub type Mean = f32;
    /// Precision, determinant and running distance.
    pub type Var = f32;

    #[inline]
    pub fn mean_from_f32(x: f32) -> Mean {
        x
    }

    #[inline]
    pub fn var_from_log(v: i32) -> Var {
        v as f32
    }

    #[inline(always)]
    pub fn sub(a: Mean, b: Mean) -> Mean {
        a - b
    }

    #[inline(always)]
    pub fn mul(a: Mean, b: Mean) -> Mean {
        a * b
    }

    #[inline(always)]
    pub fn weigh(sqdiff: Mean, var: Var) -> Var {
        sqdiff * var
    }

    #[inline(always)]
    pub fn gmm_sub(a: Var, b: Var) -> Var {
        a - b
    }

    #[inline(always)]
    pub fn at_least(d: Var, score: i32) -> bool {
        d >= score as f32
    }

    #[inline(always)]
    pub fn to_score(d: Var) -> i32 {
        d as i32
    }
}

#[cfg(feature = "fixed-point")]
mod imp {
    /// Fractional bits of fixed-point means and observations.
    pub const RADIX: u32 = 12;

    pub type Mean = i32;
    pub type Var = i32;

    #[inline]
    pub fn mean_from_f32(x: f32) -> Mean {
        let scaled = x * (1u32 << RADIX) as f32;
        if x < 0.0 {
            (scaled - 0.5) as i32
        } else {
            (scaled + 0.5) as i32
        }
    }

    #[inline]
    pub fn var_from_log(v: i32) -> Var {
        v
    }

    #[inline(always)]
    pub fn sub(a: Mean, b: Mean) -> Mean {
        a.wrapping_sub(b)
    }

    #[inline(always)]
    pub fn mul(a: Mean, b: Mean) -> Mean {
        ((i64::from(a) * i64::from(b)) >> RADIX) as i32
    }

    #[inline(always)]
    pub fn weigh(sqdiff: Mean, var: Var) -> Var {
        ((i64::from(sqdiff) * i64::from(var)) >> RADIX) as i32
    }

    #[inline(always)]
    pub fn gmm_sub(a: Var, b: Var) -> Var {
        a.saturating_sub(b)
    }

    #[inline(always)]
    pub fn at_least(d: Var, score: i32) -> bool {
        d >= score
    }

    #[inline(always)]
    pub fn to_score(d: Var) -> i32 {
        d
    }
}

pub use imp::*;

/// Convert one stream's observation into the precision used by codebooks.
pub fn observation_into(src: &[f32], dst: &mut Vec<Mean>) {
    dst.clear();
    dst.extend(src.iter().map(|&x| mean_from_f32(x)));
}

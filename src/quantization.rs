//! Scalar quantization (Annex E) and DC level shifting.
//!
//! Step sizes travel as (mant, expn) pairs exactly as a QCD/QCC segment
//! would carry them; the reversible path degenerates to mant = 0,
//! expn = precision + gain.

use crate::coding_params::TileComponentParams;
use crate::dwt;

/// Quantize one step size into its 11-bit mantissa / 5-bit exponent form.
/// `stepsize` is the value scaled by 8192, `numbps` the dynamic range of
/// the band.
pub fn encode_stepsize(stepsize: i32, numbps: i32) -> (u32, u32) {
    let p = crate::math::floor_log2(stepsize as u32) as i32 - 13;
    let n = 11 - crate::math::floor_log2(stepsize as u32) as i32;
    let mant = (if n < 0 {
        (stepsize >> -n) as u32
    } else {
        (stepsize << n) as u32
    }) & 0x7FF;
    (mant, (numbps - p) as u32)
}

/// Fill the per-band step sizes for one tile component (E.1.1), in
/// LL, (HL, LH, HH)* order from the lowest resolution upward.
pub fn calc_explicit_stepsizes(tccp: &mut TileComponentParams, precision: u32) {
    let numbands = 3 * tccp.num_resolutions - 2;
    tccp.step_sizes.clear();
    for bandno in 0..numbands {
        let resno = if bandno == 0 { 0 } else { (bandno - 1) / 3 + 1 };
        let orient = if bandno == 0 { 0 } else { (bandno - 1) % 3 + 1 };
        let level = tccp.num_resolutions - 1 - resno;
        let gain = if tccp.qmfbid == 0 {
            0
        } else {
            dwt::gain_53(orient)
        };
        let stepsize = if tccp.qmfbid == 1 {
            1.0
        } else {
            let norm = dwt::norm_97(level, orient);
            f64::from(1u32 << gain) / norm
        };
        let (mant, expn) = encode_stepsize(
            (stepsize * 8192.0).floor() as i32,
            (precision + gain) as i32,
        );
        tccp.step_sizes.push((mant, expn));
    }
}

/// Reconstruct the real step size of a band from its coded form.
/// `numbps` is `precision + gain`; `fraction` is 1.0 on the compress side
/// and 0.5 on the decompress side, folding in the half-LSB the block
/// decoder leaves in its magnitudes.
pub fn band_stepsize(mant: u32, expn: u32, numbps: u32, fraction: f32) -> f32 {
    ((1.0 + mant as f64 / 2048.0) * 2f64.powi(numbps as i32 - expn as i32)) as f32 * fraction
}

/// Dead-zone scalar quantizer: q = sign(x) * floor(|x| / delta).
#[inline]
pub fn quantize_scalar(coeff: f32, step_size: f32) -> i32 {
    let q = (coeff.abs() / step_size) as i32;
    if coeff < 0.0 {
        -q
    } else {
        q
    }
}

/// Mid-bin reconstruction for a dead-zone quantizer.
#[inline]
pub fn dequantize_scalar(q: i32, step_size: f32) -> f32 {
    if q == 0 {
        0.0
    } else if q > 0 {
        (q as f32 + 0.5) * step_size
    } else {
        (q as f32 - 0.5) * step_size
    }
}

/// Offset subtracted before coding an unsigned component.
#[inline]
pub fn dc_offset(precision: u32, signed: bool) -> i32 {
    if signed {
        0
    } else {
        1 << (precision - 1)
    }
}

/// Legal output range after the inverse shift.
#[inline]
pub fn sample_range(precision: u32, signed: bool) -> (i32, i32) {
    if signed {
        (-(1 << (precision - 1)), (1 << (precision - 1)) - 1)
    } else {
        (0, (1i32 << precision) - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reversible_stepsizes_are_trivial() {
        let mut tccp = TileComponentParams {
            num_resolutions: 3,
            cblk_w_exp: 6,
            cblk_h_exp: 6,
            cblk_sty: 0,
            qmfbid: 1,
            num_guard_bits: 2,
            roi_shift: 0,
            step_sizes: Vec::new(),
            precincts: vec![(15, 15); 3],
        };
        calc_explicit_stepsizes(&mut tccp, 8);
        assert_eq!(tccp.step_sizes.len(), 7);
        // LL: mant 0, expn = prec + gain(LL) = 8.
        assert_eq!(tccp.step_sizes[0], (0, 8));
        // The top-resolution HH band gains 2 bits.
        assert_eq!(tccp.step_sizes[6], (0, 10));
        // Reconstructed reversible step is exactly 1.
        let (mant, expn) = tccp.step_sizes[0];
        assert_eq!(band_stepsize(mant, expn, 8, 1.0), 1.0);
    }

    #[test]
    fn test_irreversible_stepsizes_follow_norms() {
        let mut tccp = TileComponentParams {
            num_resolutions: 5,
            cblk_w_exp: 6,
            cblk_h_exp: 6,
            cblk_sty: 0,
            qmfbid: 0,
            num_guard_bits: 2,
            roi_shift: 0,
            step_sizes: Vec::new(),
            precincts: vec![(15, 15); 5],
        };
        calc_explicit_stepsizes(&mut tccp, 8);
        assert_eq!(tccp.step_sizes.len(), 13);
        for (bandno, &(mant, expn)) in tccp.step_sizes.iter().enumerate() {
            let orient = if bandno == 0 {
                0
            } else {
                (bandno as u32 - 1) % 3 + 1
            };
            let level = if bandno == 0 {
                4
            } else {
                4 - ((bandno as u32 - 1) / 3)
            };
            let want = 1.0 / dwt::norm_97(level, orient);
            let got = f64::from(band_stepsize(mant, expn, 8, 1.0));
            let err = (got - want).abs() / want;
            assert!(err < 0.001, "band {bandno}: {got} vs {want}");
        }
    }

    #[test]
    fn test_quantize_roundtrip_within_step() {
        let step = 2.0;
        for &v in &[0.0f32, 0.4, 10.5, -10.5, 100.0, -3.1] {
            let q = quantize_scalar(v, step);
            let r = dequantize_scalar(q, step);
            assert!((v - r).abs() <= step, "{v} -> {q} -> {r}");
        }
    }

    #[test]
    fn test_dc_offset_and_range() {
        assert_eq!(dc_offset(8, false), 128);
        assert_eq!(dc_offset(8, true), 0);
        assert_eq!(sample_range(8, false), (0, 255));
        assert_eq!(sample_range(12, true), (-2048, 2047));
    }
}

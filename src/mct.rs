//! Multi-component transforms: reversible RCT, irreversible ICT with the
//! Q13 fixed-point forward constants, and the arbitrary-matrix variant.
//!
//! Sample runs are chunked across the pool; the contract is the scalar
//! code below, bit-identical for the integer paths.

use rayon::prelude::*;

/// Samples per parallel chunk.
const CHUNK: usize = 1 << 12;

/// Basis norms of the reversible transform, used to weight distortion
/// estimates per component.
pub const NORMS_RCT: [f64; 3] = [1.732, 0.8292, 0.8292];
/// Basis norms of the irreversible transform.
pub const NORMS_ICT: [f64; 3] = [1.732, 1.805, 1.573];

#[inline]
fn fix_mul(a: i32, b: i32) -> i32 {
    let t = a as i64 * b as i64 + 4096;
    (t >> 13) as i32
}

/// Forward reversible transform: RGB -> Y, U, V.
pub fn forward_rct(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
    c0.par_chunks_mut(CHUNK)
        .zip(c1.par_chunks_mut(CHUNK))
        .zip(c2.par_chunks_mut(CHUNK))
        .for_each(|((r, g), b)| {
            for i in 0..r.len() {
                let (rr, gg, bb) = (r[i], g[i], b[i]);
                let y = (rr + 2 * gg + bb) >> 2;
                let u = bb - gg;
                let v = rr - gg;
                r[i] = y;
                g[i] = u;
                b[i] = v;
            }
        });
}

/// Inverse reversible transform: exact for all inputs.
pub fn inverse_rct(c0: &mut [i32], c1: &mut [i32], c2: &mut [i32]) {
    c0.par_chunks_mut(CHUNK)
        .zip(c1.par_chunks_mut(CHUNK))
        .zip(c2.par_chunks_mut(CHUNK))
        .for_each(|((y, u), v)| {
            for i in 0..y.len() {
                let (yy, uu, vv) = (y[i], u[i], v[i]);
                let g = yy - ((uu + vv) >> 2);
                let r = vv + g;
                let b = uu + g;
                y[i] = r;
                u[i] = g;
                v[i] = b;
            }
        });
}

/// Forward irreversible transform in Q13 fixed point.
pub fn forward_ict(c0: &mut [f32], c1: &mut [f32], c2: &mut [f32]) {
    c0.par_chunks_mut(CHUNK)
        .zip(c1.par_chunks_mut(CHUNK))
        .zip(c2.par_chunks_mut(CHUNK))
        .for_each(|((r, g), b)| {
            for i in 0..r.len() {
                let (rr, gg, bb) = (r[i] as i32, g[i] as i32, b[i] as i32);
                let y = fix_mul(rr, 2449) + fix_mul(gg, 4809) + fix_mul(bb, 934);
                let u = -fix_mul(rr, 1382) - fix_mul(gg, 2714) + fix_mul(bb, 4096);
                let v = fix_mul(rr, 4096) - fix_mul(gg, 3430) - fix_mul(bb, 666);
                r[i] = y as f32;
                g[i] = u as f32;
                b[i] = v as f32;
            }
        });
}

/// Inverse irreversible transform (float form of the BT.601 constants).
pub fn inverse_ict(c0: &mut [f32], c1: &mut [f32], c2: &mut [f32]) {
    c0.par_chunks_mut(CHUNK)
        .zip(c1.par_chunks_mut(CHUNK))
        .zip(c2.par_chunks_mut(CHUNK))
        .for_each(|((y, u), v)| {
            for i in 0..y.len() {
                let (yy, uu, vv) = (y[i], u[i], v[i]);
                let r = yy + vv * 1.402;
                let g = yy - uu * 0.34413 - vv * 0.71414;
                let b = yy + uu * 1.772;
                y[i] = r;
                u[i] = g;
                v[i] = b;
            }
        });
}

/// Apply a square matrix across N component planes, sample by sample.
pub fn forward_custom(matrix: &[f32], comps: &mut [&mut [f32]]) {
    let n = comps.len();
    debug_assert_eq!(matrix.len(), n * n);
    let len = comps.iter().map(|c| c.len()).min().unwrap_or(0);
    let mut sample = vec![0f32; n];
    for i in 0..len {
        for (k, comp) in comps.iter().enumerate() {
            sample[k] = comp[i];
        }
        for (row, comp) in comps.iter_mut().enumerate() {
            let mut acc = 0f32;
            for (col, &s) in sample.iter().enumerate() {
                acc += matrix[row * n + col] * s;
            }
            comp[i] = acc;
        }
    }
}

/// Invert the matrix (Gauss-Jordan) and apply it; singular matrices leave
/// the samples untouched and return false.
pub fn inverse_custom(matrix: &[f32], comps: &mut [&mut [f32]]) -> bool {
    let n = comps.len();
    let Some(inv) = invert_matrix(matrix, n) else {
        return false;
    };
    forward_custom(&inv, comps);
    true
}

fn invert_matrix(matrix: &[f32], n: usize) -> Option<Vec<f32>> {
    let mut a: Vec<f64> = matrix.iter().map(|&v| v as f64).collect();
    let mut inv = vec![0f64; n * n];
    for i in 0..n {
        inv[i * n + i] = 1.0;
    }
    for col in 0..n {
        let mut pivot = col;
        for row in col + 1..n {
            if a[row * n + col].abs() > a[pivot * n + col].abs() {
                pivot = row;
            }
        }
        if a[pivot * n + col].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap(col * n + k, pivot * n + k);
                inv.swap(col * n + k, pivot * n + k);
            }
        }
        let diag = a[col * n + col];
        for k in 0..n {
            a[col * n + k] /= diag;
            inv[col * n + k] /= diag;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let f = a[row * n + col];
            if f == 0.0 {
                continue;
            }
            for k in 0..n {
                a[row * n + k] -= f * a[col * n + k];
                inv[row * n + k] -= f * inv[col * n + k];
            }
        }
    }
    Some(inv.into_iter().map(|v| v as f32).collect())
}

/// Distortion weight for component `compno` under the active transform.
pub fn norm_for(mct_applied: bool, irreversible: bool, compno: usize) -> f64 {
    if !mct_applied || compno > 2 {
        return 1.0;
    }
    if irreversible {
        NORMS_ICT[compno]
    } else {
        NORMS_RCT[compno]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xorshift(state: &mut u32) -> u32 {
        *state ^= *state << 13;
        *state ^= *state >> 17;
        *state ^= *state << 5;
        *state
    }

    #[test]
    fn test_rct_exact_roundtrip() {
        let mut state = 42u32;
        let n = 4096 + 17;
        let r0: Vec<i32> = (0..n).map(|_| (xorshift(&mut state) & 0xFF) as i32).collect();
        let g0: Vec<i32> = (0..n).map(|_| (xorshift(&mut state) & 0xFF) as i32).collect();
        let b0: Vec<i32> = (0..n).map(|_| (xorshift(&mut state) & 0xFF) as i32).collect();
        let (mut r, mut g, mut b) = (r0.clone(), g0.clone(), b0.clone());
        forward_rct(&mut r, &mut g, &mut b);
        inverse_rct(&mut r, &mut g, &mut b);
        assert_eq!(r, r0);
        assert_eq!(g, g0);
        assert_eq!(b, b0);
    }

    #[test]
    fn test_ict_roundtrip_within_one_lsb() {
        let mut state = 7u32;
        let n = 2000;
        let r0: Vec<f32> = (0..n).map(|_| (xorshift(&mut state) & 0xFF) as f32 - 128.0).collect();
        let g0: Vec<f32> = (0..n).map(|_| (xorshift(&mut state) & 0xFF) as f32 - 128.0).collect();
        let b0: Vec<f32> = (0..n).map(|_| (xorshift(&mut state) & 0xFF) as f32 - 128.0).collect();
        let (mut r, mut g, mut b) = (r0.clone(), g0.clone(), b0.clone());
        forward_ict(&mut r, &mut g, &mut b);
        inverse_ict(&mut r, &mut g, &mut b);
        for i in 0..n {
            assert!((r[i] - r0[i]).abs() <= 1.0, "r at {i}: {} vs {}", r[i], r0[i]);
            assert!((g[i] - g0[i]).abs() <= 1.0, "g at {i}");
            assert!((b[i] - b0[i]).abs() <= 1.0, "b at {i}");
        }
    }

    #[test]
    fn test_custom_matrix_roundtrip() {
        let matrix = vec![0.5f32, 0.25, 0.0, -0.25, 1.0, 0.0, 0.0, 0.5, 2.0];
        let mut c0 = vec![10.0f32, -3.0, 7.5, 0.0];
        let mut c1 = vec![1.0f32, 2.0, 3.0, 4.0];
        let mut c2 = vec![-5.0f32, 6.0, 0.0, 9.0];
        let (o0, o1, o2) = (c0.clone(), c1.clone(), c2.clone());
        {
            let mut comps = [c0.as_mut_slice(), c1.as_mut_slice(), c2.as_mut_slice()];
            forward_custom(&matrix, &mut comps);
        }
        {
            let mut comps = [c0.as_mut_slice(), c1.as_mut_slice(), c2.as_mut_slice()];
            assert!(inverse_custom(&matrix, &mut comps));
        }
        for i in 0..4 {
            assert!((c0[i] - o0[i]).abs() < 1e-3);
            assert!((c1[i] - o1[i]).abs() < 1e-3);
            assert!((c2[i] - o2[i]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_singular_matrix_rejected() {
        let matrix = vec![1.0f32, 2.0, 2.0, 4.0];
        let mut c0 = vec![1.0f32];
        let mut c1 = vec![2.0f32];
        let mut comps = [c0.as_mut_slice(), c1.as_mut_slice()];
        assert!(!inverse_custom(&matrix, &mut comps));
    }
}

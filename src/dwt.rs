//! Discrete wavelet transforms: reversible 5/3 integer lifting and
//! irreversible 9/7 float lifting (Annex F), full-tile both directions plus
//! the windowed inverse used for region decode.
//!
//! Sub-bands live deinterleaved in the tile buffer (low half first on each
//! axis); every 1-D pass interleaves a line into scratch, lifts, and copies
//! back. `cas` is the parity of the resolution origin on that axis and
//! selects between the two mirrored algorithms.

use rayon::prelude::*;

use crate::math::Rect;

/// Gain of the 5/3 filter per band orientation (0 = LL, 1 = HL, 2 = LH,
/// 3 = HH).
pub fn gain_53(orient: u32) -> u32 {
    match orient {
        0 => 0,
        1 | 2 => 1,
        _ => 2,
    }
}

/// The 9/7 filter carries its gain in the step sizes instead.
pub fn gain_97(_orient: u32) -> u32 {
    0
}

/// L2 norms of the 5/3 synthesis basis per decomposition level.
const NORMS_53: [[f64; 10]; 4] = [
    [1.000, 1.500, 2.750, 5.375, 10.68, 21.34, 42.67, 85.33, 170.7, 341.3],
    [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 361.8],
    [1.038, 1.592, 2.919, 5.703, 11.33, 22.64, 45.25, 90.48, 180.9, 361.8],
    [0.7186, 0.9218, 1.586, 3.043, 6.019, 12.01, 24.00, 47.97, 95.93, 191.9],
];

/// L2 norms of the 9/7 synthesis basis per decomposition level.
const NORMS_97: [[f64; 10]; 4] = [
    [1.000, 1.965, 4.177, 8.403, 16.90, 33.84, 67.69, 135.3, 270.6, 540.9],
    [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 1098.0],
    [2.022, 3.989, 8.355, 17.04, 34.27, 68.63, 137.3, 274.6, 549.0, 1098.0],
    [2.080, 3.865, 8.307, 17.18, 34.71, 69.59, 139.3, 278.6, 557.2, 1114.0],
];

pub fn norm_53(level: u32, orient: u32) -> f64 {
    NORMS_53[orient as usize][(level as usize).min(9)]
}

pub fn norm_97(level: u32, orient: u32) -> f64 {
    NORMS_97[orient as usize][(level as usize).min(9)]
}

// 9/7 lifting constants (F.4.8.2).
const ALPHA: f32 = -1.586_134_3;
const BETA: f32 = -0.052_980_118;
const GAMMA: f32 = 0.882_911_1;
const DELTA: f32 = 0.443_506_85;
const K: f32 = 1.230_174_1;
const INV_K: f32 = 1.0 / K;

// Interleaved accessors: S(i) at even positions, D(i) at odd positions,
// with symmetric clamping at the signal ends. The `ss`/`dd` variants are
// the mirrored pair used when the line starts on an odd coordinate.
#[inline]
fn s(a: &[i32], i: i64) -> i32 {
    a[(i << 1) as usize]
}
#[inline]
fn d(a: &[i32], i: i64) -> i32 {
    a[(1 + (i << 1)) as usize]
}
#[inline]
fn s_(a: &[i32], i: i64, sn: i64) -> i32 {
    if i < 0 {
        s(a, 0)
    } else if i >= sn {
        s(a, sn - 1)
    } else {
        s(a, i)
    }
}
#[inline]
fn d_(a: &[i32], i: i64, dn: i64) -> i32 {
    if i < 0 {
        d(a, 0)
    } else if i >= dn {
        d(a, dn - 1)
    } else {
        d(a, i)
    }
}
#[inline]
fn ss_(a: &[i32], i: i64, dn: i64) -> i32 {
    if i < 0 {
        s(a, 0)
    } else if i >= dn {
        s(a, dn - 1)
    } else {
        s(a, i)
    }
}
#[inline]
fn dd_(a: &[i32], i: i64, sn: i64) -> i32 {
    if i < 0 {
        d(a, 0)
    } else if i >= sn {
        d(a, sn - 1)
    } else {
        d(a, i)
    }
}

/// Forward 5/3 lifting over one interleaved line.
pub fn encode_line_53(a: &mut [i32], dn: i64, sn: i64, cas: u8) {
    if cas == 0 {
        if dn > 0 || sn > 1 {
            for i in 0..dn {
                let v = (s_(a, i, sn) + s_(a, i + 1, sn)) >> 1;
                a[(1 + (i << 1)) as usize] -= v;
            }
            for i in 0..sn {
                let v = (d_(a, i - 1, dn) + d_(a, i, dn) + 2) >> 2;
                a[(i << 1) as usize] += v;
            }
        }
    } else if sn == 0 && dn == 1 {
        a[0] <<= 1;
    } else {
        for i in 0..dn {
            let v = (dd_(a, i, sn) + dd_(a, i - 1, sn)) >> 1;
            a[(i << 1) as usize] -= v;
        }
        for i in 0..sn {
            let v = (ss_(a, i, dn) + ss_(a, i + 1, dn) + 2) >> 2;
            a[(1 + (i << 1)) as usize] += v;
        }
    }
}

/// Inverse 5/3 lifting over one interleaved line.
pub fn decode_line_53(a: &mut [i32], dn: i64, sn: i64, cas: u8) {
    decode_line_53_ranged(a, dn, sn, cas, 0, sn, 0, dn);
}

/// Inverse 5/3 restricted to index ranges, for windowed decode. The even
/// range bounds the update step, the odd range the predict step; both are
/// in uninterleaved indices.
pub fn decode_line_53_ranged(
    a: &mut [i32],
    dn: i64,
    sn: i64,
    cas: u8,
    even_lo: i64,
    even_hi: i64,
    odd_lo: i64,
    odd_hi: i64,
) {
    if cas == 0 {
        if dn > 0 || sn > 1 {
            for i in even_lo..even_hi {
                let v = (d_(a, i - 1, dn) + d_(a, i, dn) + 2) >> 2;
                a[(i << 1) as usize] -= v;
            }
            for i in odd_lo..odd_hi {
                let v = (s_(a, i, sn) + s_(a, i + 1, sn)) >> 1;
                a[(1 + (i << 1)) as usize] += v;
            }
        }
    } else if sn == 0 && dn == 1 {
        a[0] >>= 1;
    } else {
        // Mirrored roles: the update touches odd slots, the predict even.
        for i in even_lo..even_hi.min(sn) {
            let v = (ss_(a, i, dn) + ss_(a, i + 1, dn) + 2) >> 2;
            a[(1 + (i << 1)) as usize] -= v;
        }
        for i in odd_lo..odd_hi.min(dn) {
            let v = (dd_(a, i, sn) + dd_(a, i - 1, sn)) >> 1;
            a[(i << 1) as usize] += v;
        }
    }
}

// f32 variants of the interleaved accessors.
#[inline]
fn fs_(a: &[f32], i: i64, sn: i64) -> f32 {
    let i = i.clamp(0, sn - 1);
    a[(i << 1) as usize]
}
#[inline]
fn fd_(a: &[f32], i: i64, dn: i64) -> f32 {
    let i = i.clamp(0, dn - 1);
    a[(1 + (i << 1)) as usize]
}
#[inline]
fn fss_(a: &[f32], i: i64, dn: i64) -> f32 {
    let i = i.clamp(0, dn - 1);
    a[(i << 1) as usize]
}
#[inline]
fn fdd_(a: &[f32], i: i64, sn: i64) -> f32 {
    let i = i.clamp(0, sn - 1);
    a[(1 + (i << 1)) as usize]
}

/// Forward 9/7 lifting over one interleaved line.
pub fn encode_line_97(a: &mut [f32], dn: i64, sn: i64, cas: u8) {
    if sn + dn < 2 {
        // A single coefficient passes through (scaled as a low-pass sample).
        return;
    }
    if cas == 0 {
        for i in 0..dn {
            let v = ALPHA * (fs_(a, i, sn) + fs_(a, i + 1, sn));
            a[(1 + (i << 1)) as usize] += v;
        }
        for i in 0..sn {
            let v = BETA * (fd_(a, i - 1, dn) + fd_(a, i, dn));
            a[(i << 1) as usize] += v;
        }
        for i in 0..dn {
            let v = GAMMA * (fs_(a, i, sn) + fs_(a, i + 1, sn));
            a[(1 + (i << 1)) as usize] += v;
        }
        for i in 0..sn {
            let v = DELTA * (fd_(a, i - 1, dn) + fd_(a, i, dn));
            a[(i << 1) as usize] += v;
        }
        for i in 0..sn {
            a[(i << 1) as usize] *= INV_K;
        }
        for i in 0..dn {
            a[(1 + (i << 1)) as usize] *= K;
        }
    } else {
        for i in 0..dn {
            let v = ALPHA * (fdd_(a, i, sn) + fdd_(a, i - 1, sn));
            a[(i << 1) as usize] += v;
        }
        for i in 0..sn {
            let v = BETA * (fss_(a, i, dn) + fss_(a, i + 1, dn));
            a[(1 + (i << 1)) as usize] += v;
        }
        for i in 0..dn {
            let v = GAMMA * (fdd_(a, i, sn) + fdd_(a, i - 1, sn));
            a[(i << 1) as usize] += v;
        }
        for i in 0..sn {
            let v = DELTA * (fss_(a, i, dn) + fss_(a, i + 1, dn));
            a[(1 + (i << 1)) as usize] += v;
        }
        for i in 0..sn {
            a[(1 + (i << 1)) as usize] *= INV_K;
        }
        for i in 0..dn {
            a[(i << 1) as usize] *= K;
        }
    }
}

/// Inverse 9/7 lifting over one interleaved line.
pub fn decode_line_97(a: &mut [f32], dn: i64, sn: i64, cas: u8) {
    decode_line_97_ranged(a, dn, sn, cas, 0, sn, 0, dn);
}

pub fn decode_line_97_ranged(
    a: &mut [f32],
    dn: i64,
    sn: i64,
    cas: u8,
    even_lo: i64,
    even_hi: i64,
    odd_lo: i64,
    odd_hi: i64,
) {
    if sn + dn < 2 {
        return;
    }
    // Widen the inner steps so the outer ones see lifted neighbours.
    let (e0, e1) = ((even_lo - 2).max(0), (even_hi + 2).min(sn));
    let (o0, o1) = ((odd_lo - 2).max(0), (odd_hi + 2).min(dn));
    if cas == 0 {
        for i in e0..e1 {
            a[(i << 1) as usize] *= K;
        }
        for i in o0..o1 {
            a[(1 + (i << 1)) as usize] *= INV_K;
        }
        for i in e0..e1 {
            let v = DELTA * (fd_(a, i - 1, dn) + fd_(a, i, dn));
            a[(i << 1) as usize] -= v;
        }
        for i in o0..o1 {
            let v = GAMMA * (fs_(a, i, sn) + fs_(a, i + 1, sn));
            a[(1 + (i << 1)) as usize] -= v;
        }
        for i in even_lo.max(0)..even_hi.min(sn) {
            let v = BETA * (fd_(a, i - 1, dn) + fd_(a, i, dn));
            a[(i << 1) as usize] -= v;
        }
        for i in odd_lo.max(0)..odd_hi.min(dn) {
            let v = ALPHA * (fs_(a, i, sn) + fs_(a, i + 1, sn));
            a[(1 + (i << 1)) as usize] -= v;
        }
    } else {
        for i in e0..e1.min(sn) {
            a[(1 + (i << 1)) as usize] *= K;
        }
        for i in o0..o1.min(dn) {
            a[(i << 1) as usize] *= INV_K;
        }
        for i in e0..e1.min(sn) {
            let v = DELTA * (fss_(a, i, dn) + fss_(a, i + 1, dn));
            a[(1 + (i << 1)) as usize] -= v;
        }
        for i in o0..o1.min(dn) {
            let v = GAMMA * (fdd_(a, i, sn) + fdd_(a, i - 1, sn));
            a[(i << 1) as usize] -= v;
        }
        for i in even_lo.max(0)..even_hi.min(sn) {
            let v = BETA * (fss_(a, i, dn) + fss_(a, i + 1, dn));
            a[(1 + (i << 1)) as usize] -= v;
        }
        for i in odd_lo.max(0)..odd_hi.min(dn) {
            let v = ALPHA * (fdd_(a, i, sn) + fdd_(a, i - 1, sn));
            a[(i << 1) as usize] -= v;
        }
    }
}

/// Copy one interleaved line back into natural (deinterleaved) order:
/// evens to the low half, odds to the high half.
fn deinterleave<T: Copy>(line: &[T], out: &mut [T], dn: i64, sn: i64, cas: u8) {
    for i in 0..sn {
        out[i as usize] = line[((i << 1) + cas as i64) as usize];
    }
    for i in 0..dn {
        out[(sn + i) as usize] = line[((i << 1) + 1 - cas as i64) as usize];
    }
}

/// The inverse: gather the low and high halves into one interleaved line.
fn interleave<T: Copy>(src: &[T], line: &mut [T], dn: i64, sn: i64, cas: u8) {
    for i in 0..sn {
        line[((i << 1) + cas as i64) as usize] = src[i as usize];
    }
    for i in 0..dn {
        line[((i << 1) + 1 - cas as i64) as usize] = src[(sn + i) as usize];
    }
}

fn gather_column<T: Copy>(data: &[T], stride: usize, x: usize, h: usize, out: &mut [T]) {
    for (y, slot) in out.iter_mut().enumerate().take(h) {
        *slot = data[y * stride + x];
    }
}

fn scatter_column<T: Copy>(data: &mut [T], stride: usize, x: usize, col: &[T]) {
    for (y, &v) in col.iter().enumerate() {
        data[y * stride + x] = v;
    }
}

macro_rules! dwt_2d {
    ($enc:ident, $dec:ident, $ty:ty, $zero:expr, $enc_line:ident, $dec_line:ident) => {
        /// Forward transform over the whole tile component. `res` holds the
        /// resolution bounds from the lowest resolution up; levels run from
        /// the full image downward.
        pub fn $enc(data: &mut [$ty], stride: usize, res: &[Rect]) {
            let numres = res.len();
            if numres <= 1 {
                return;
            }
            for level in (1..numres).rev() {
                let cur = res[level];
                let low = res[level - 1];
                let rw = cur.width() as i64;
                let rh = cur.height() as i64;
                let rw1 = low.width() as i64;
                let rh1 = low.height() as i64;
                let cas_col = (cur.y0 & 1) as u8;
                let cas_row = (cur.x0 & 1) as u8;

                // Vertical pass over each column.
                let sn = rh1;
                let dn = rh - rh1;
                if rh > 0 {
                    let cols: Vec<(usize, Vec<$ty>)> = (0..rw as usize)
                        .into_par_iter()
                        .map(|x| {
                            let mut col = vec![$zero; rh as usize];
                            gather_column(data, stride, x, rh as usize, &mut col);
                            let mut line = vec![$zero; rh as usize];
                            line.copy_from_slice(&col);
                            $enc_line(&mut line, dn, sn, cas_col);
                            deinterleave(&line, &mut col, dn, sn, cas_col);
                            (x, col)
                        })
                        .collect();
                    for (x, col) in cols {
                        scatter_column(data, stride, x, &col);
                    }
                }

                // Horizontal pass over each row.
                let sn = rw1;
                let dn = rw - rw1;
                if rw > 0 {
                    data[..rh as usize * stride]
                        .par_chunks_mut(stride)
                        .for_each(|row| {
                            let mut line = vec![$zero; rw as usize];
                            line.copy_from_slice(&row[..rw as usize]);
                            $enc_line(&mut line, dn, sn, cas_row);
                            deinterleave(&line, &mut row[..rw as usize], dn, sn, cas_row);
                        });
                }
            }
        }

        /// Inverse transform up to `numres` resolutions.
        pub fn $dec(data: &mut [$ty], stride: usize, res: &[Rect], numres: usize) {
            if numres <= 1 {
                return;
            }
            let mut rw = res[0].width() as i64;
            let mut rh = res[0].height() as i64;
            for level in 1..numres {
                let cur = res[level];
                let sn_h = rw;
                let sn_v = rh;
                rw = cur.width() as i64;
                rh = cur.height() as i64;
                let dn_h = rw - sn_h;
                let dn_v = rh - sn_v;
                let cas_row = (cur.x0 & 1) as u8;
                let cas_col = (cur.y0 & 1) as u8;

                // Horizontal pass.
                if rh > 0 && rw > 0 {
                    data[..rh as usize * stride]
                        .par_chunks_mut(stride)
                        .for_each(|row| {
                            let mut line = vec![$zero; rw as usize];
                            interleave(&row[..rw as usize], &mut line, dn_h, sn_h, cas_row);
                            $dec_line(&mut line, dn_h, sn_h, cas_row);
                            row[..rw as usize].copy_from_slice(&line);
                        });
                }

                // Vertical pass.
                if rw > 0 && rh > 0 {
                    let cols: Vec<(usize, Vec<$ty>)> = (0..rw as usize)
                        .into_par_iter()
                        .map(|x| {
                            let mut col = vec![$zero; rh as usize];
                            gather_column(data, stride, x, rh as usize, &mut col);
                            let mut line = vec![$zero; rh as usize];
                            interleave(&col, &mut line, dn_v, sn_v, cas_col);
                            $dec_line(&mut line, dn_v, sn_v, cas_col);
                            (x, line)
                        })
                        .collect();
                    for (x, line) in cols {
                        scatter_column(data, stride, x, &line);
                    }
                }
            }
        }
    };
}

dwt_2d!(encode_53, decode_53, i32, 0i32, encode_line_53, decode_line_53);
dwt_2d!(encode_97, decode_97, f32, 0f32, encode_line_97, decode_line_97);

/// Per-level index ranges steering the windowed inverse transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionRanges {
    /// Uninterleaved even/odd ranges, horizontal axis.
    pub h_even: (i64, i64),
    pub h_odd: (i64, i64),
    /// Uninterleaved even/odd ranges, vertical axis.
    pub v_even: (i64, i64),
    pub v_odd: (i64, i64),
    /// Interleaved output ranges.
    pub ih: (i64, i64),
    pub iv: (i64, i64),
}

macro_rules! dwt_region {
    ($name:ident, $ty:ty, $zero:expr, $dec_line_ranged:ident) => {
        /// Windowed inverse: lift only inside the per-level ranges plus the
        /// filter footprint. Output matches the full transform inside the
        /// window.
        pub fn $name(
            data: &mut [$ty],
            stride: usize,
            res: &[Rect],
            numres: usize,
            ranges: &[RegionRanges],
        ) {
            if numres <= 1 {
                return;
            }
            let max_w = res[..numres].iter().map(|r| r.width()).max().unwrap_or(0);
            let max_h = res[..numres].iter().map(|r| r.height()).max().unwrap_or(0);
            let mut line = vec![$zero; max_w.max(max_h) as usize + 4];

            let mut rw = res[0].width() as i64;
            let mut rh = res[0].height() as i64;
            for level in 1..numres {
                let cur = res[level];
                let rr = ranges[level - 1];
                let sn_h = rw;
                let sn_v = rh;
                rw = cur.width() as i64;
                rh = cur.height() as i64;
                let dn_h = rw - sn_h;
                let dn_v = rh - sn_v;
                let cas_row = (cur.x0 & 1) as u8;
                let cas_col = (cur.y0 & 1) as u8;

                if rw > 0 {
                    let mut do_row = |y: i64, data: &mut [$ty], line: &mut [$ty]| {
                        if y < 0 || y >= rh {
                            return;
                        }
                        let row = &mut data[y as usize * stride..y as usize * stride + rw as usize];
                        interleave(row, &mut line[..rw as usize], dn_h, sn_h, cas_row);
                        $dec_line_ranged(
                            &mut line[..rw as usize],
                            dn_h,
                            sn_h,
                            cas_row,
                            rr.h_even.0,
                            rr.h_even.1,
                            rr.h_odd.0,
                            rr.h_odd.1,
                        );
                        let (lo, hi) = rr.ih;
                        let (lo, hi) = (lo.max(0) as usize, hi.min(rw) as usize);
                        row[lo..hi].copy_from_slice(&line[lo..hi]);
                    };
                    // Horizontal lift on every row the vertical pass reads:
                    // the even rows of the low half and the odd rows of the
                    // high half.
                    for y in rr.v_even.0.max(0)..rr.v_even.1.min(sn_v) {
                        do_row(y, data, &mut line);
                    }
                    for y in rr.v_odd.0.max(0)..rr.v_odd.1.min(dn_v.max(0)) {
                        do_row(sn_v + y, data, &mut line);
                    }
                }

                if rh > 0 {
                    let (lo, hi) = rr.ih;
                    for x in lo.max(0)..hi.min(rw) {
                        let mut col = vec![$zero; rh as usize];
                        gather_column(data, stride, x as usize, rh as usize, &mut col);
                        interleave(&col, &mut line[..rh as usize], dn_v, sn_v, cas_col);
                        $dec_line_ranged(
                            &mut line[..rh as usize],
                            dn_v,
                            sn_v,
                            cas_col,
                            rr.v_even.0,
                            rr.v_even.1,
                            rr.v_odd.0,
                            rr.v_odd.1,
                        );
                        let (vlo, vhi) = rr.iv;
                        let (vlo, vhi) = (vlo.max(0) as usize, vhi.min(rh) as usize);
                        for y in vlo..vhi {
                            data[y * stride + x as usize] = line[y];
                        }
                    }
                }
            }
        }
    };
}

dwt_region!(decode_53_region, i32, 0i32, decode_line_53_ranged);
dwt_region!(decode_97_region, f32, 0f32, decode_line_97_ranged);

#[cfg(test)]
mod tests {
    use super::*;

    fn xorshift(state: &mut u32) -> u32 {
        *state ^= *state << 13;
        *state ^= *state >> 17;
        *state ^= *state << 5;
        *state
    }

    /// Resolution pyramid for an origin-anchored region.
    fn pyramid(x0: u32, y0: u32, x1: u32, y1: u32, numres: u32) -> Vec<Rect> {
        (0..numres)
            .map(|r| {
                let level = numres - 1 - r;
                Rect {
                    x0: crate::math::ceil_div_pow2(x0, level),
                    y0: crate::math::ceil_div_pow2(y0, level),
                    x1: crate::math::ceil_div_pow2(x1, level),
                    y1: crate::math::ceil_div_pow2(y1, level),
                }
            })
            .collect()
    }

    #[test]
    fn test_53_line_roundtrip_all_parities() {
        let mut state = 17u32;
        for &len in &[1usize, 2, 3, 5, 8, 13, 64] {
            for cas in 0..2u8 {
                let src: Vec<i32> = (0..len).map(|_| (xorshift(&mut state) % 2048) as i32 - 1024).collect();
                let sn = (len as i64 + 1 - cas as i64) / 2;
                let dn = len as i64 - sn;
                if sn == 0 && dn == 0 {
                    continue;
                }
                let mut line = src.clone();
                encode_line_53(&mut line, dn, sn, cas);
                decode_line_53(&mut line, dn, sn, cas);
                assert_eq!(src, line, "len {len} cas {cas}");
            }
        }
    }

    #[test]
    fn test_53_2d_roundtrip_levels_and_parities() {
        let mut state = 99u32;
        for &(x0, y0, x1, y1) in &[(0u32, 0u32, 16u32, 16u32), (1, 0, 18, 15), (3, 5, 40, 33)] {
            for numres in 1..=6u32 {
                let res = pyramid(x0, y0, x1, y1, numres);
                let w = (x1 - x0) as usize;
                let h = (y1 - y0) as usize;
                let src: Vec<i32> = (0..w * h)
                    .map(|_| (xorshift(&mut state) % 512) as i32 - 256)
                    .collect();
                let mut data = src.clone();
                encode_53(&mut data, w, &res);
                decode_53(&mut data, w, &res, numres as usize);
                assert_eq!(src, data, "region ({x0},{y0})-({x1},{y1}) numres {numres}");
            }
        }
    }

    #[test]
    fn test_53_deep_roundtrip() {
        // Deep pyramids must stay bit-exact.
        let mut state = 3u32;
        let res = pyramid(0, 0, 256, 256, 8);
        let src: Vec<i32> = (0..256 * 256)
            .map(|_| (xorshift(&mut state) % 65536) as i32 - 32768)
            .collect();
        let mut data = src.clone();
        encode_53(&mut data, 256, &res);
        decode_53(&mut data, 256, &res, 8);
        assert_eq!(src, data);
    }

    #[test]
    fn test_97_2d_near_inverse() {
        let mut state = 11u32;
        let res = pyramid(0, 0, 64, 64, 5);
        let src: Vec<f32> = (0..64 * 64)
            .map(|_| (xorshift(&mut state) % 512) as f32 - 256.0)
            .collect();
        let mut data = src.clone();
        encode_97(&mut data, 64, &res);
        decode_97(&mut data, 64, &res, 5);
        let mut sse = 0f64;
        for i in 0..src.len() {
            let e = (src[i] - data[i]) as f64;
            sse += e * e;
        }
        let rms = (sse / src.len() as f64).sqrt();
        assert!(rms < 2f64.powi(-10), "rms {rms}");
    }

    #[test]
    fn test_97_odd_sizes() {
        let mut state = 5u32;
        let res = pyramid(1, 1, 24, 19, 3);
        let w = 23usize;
        let h = 18usize;
        let src: Vec<f32> = (0..w * h)
            .map(|_| (xorshift(&mut state) % 256) as f32 - 128.0)
            .collect();
        let mut data = src.clone();
        encode_97(&mut data, w, &res);
        decode_97(&mut data, w, &res, 3);
        for i in 0..src.len() {
            assert!((src[i] - data[i]).abs() < 0.01, "at {i}: {} vs {}", src[i], data[i]);
        }
    }

    #[test]
    fn test_region_decode_matches_full_inside_window() {
        let mut state = 7u32;
        let numres = 4usize;
        let res = pyramid(0, 0, 64, 64, numres as u32);
        let src: Vec<i32> = (0..64 * 64)
            .map(|_| (xorshift(&mut state) % 512) as i32 - 256)
            .collect();
        let mut full = src.clone();
        encode_53(&mut full, 64, &res);
        let coeffs = full.clone();
        decode_53(&mut full, 64, &res, numres);

        // Window (20,20)-(40,40) at full resolution.
        let win = Rect {
            x0: 20,
            y0: 20,
            x1: 40,
            y1: 40,
        };
        let ranges = crate::buffer::region_ranges(&res, numres, win, 2);
        let mut windowed = coeffs;
        decode_53_region(&mut windowed, 64, &res, numres, &ranges);
        for y in 20..40 {
            for x in 20..40 {
                assert_eq!(
                    windowed[y * 64 + x],
                    full[y * 64 + x],
                    "mismatch at ({x},{y})"
                );
            }
        }
    }
}

//! Rate-distortion allocation: picking the pass truncation point of every
//! code block for each quality layer.
//!
//! Two bisection searches share the layer-building primitive: the simple
//! variant walks raw distortion/rate slopes in float space, the feasible
//! variant (the default) first reduces every block to its convex hull and
//! bisects over a 16-bit slope index, so layers land on the
//! rate-distortion frontier.

use log::warn;

use crate::coding_params::{RateControlAlgorithm, TileCodingParams};
use crate::error::Result;
use crate::image::Image;
use crate::t2;
use crate::tile::{CodeBlock, Tile};

/// Quantize a positive slope into the 16-bit bisection domain
/// (log2 scale, 512 steps per octave), monotone in the slope.
fn slope_index(slope: f64) -> u16 {
    if slope <= 0.0 {
        return 1;
    }
    let idx = slope.log2() * 512.0 + 32768.0;
    idx.clamp(1.0, 65534.0) as u16
}

/// Keep only passes on the convex hull of (rate, distortion) and stamp
/// their slope indices; dominated passes get slope 0 and are never chosen
/// as truncation points by the feasible allocator.
pub fn convex_hull(passes: &mut [CodeBlock]) {
    for cblk in passes {
        hull_one(cblk);
    }
}

fn hull_one(cblk: &mut CodeBlock) {
    let n = cblk.num_passes_encoded as usize;
    for pass in cblk.passes.iter_mut() {
        pass.slope = 0;
    }
    if n == 0 {
        return;
    }
    // Hull stack over cumulative (rate, distortion), origin implied.
    let mut stack: Vec<usize> = Vec::with_capacity(n);
    let point = |cblk: &CodeBlock, idx: Option<usize>| -> (f64, f64) {
        match idx {
            None => (0.0, 0.0),
            Some(i) => (
                cblk.passes[i].rate as f64,
                cblk.passes[i].distortiondec,
            ),
        }
    };
    for i in 0..n {
        let (ri, di) = point(cblk, Some(i));
        loop {
            let prev = stack.last().copied();
            let (rp, dp) = point(cblk, prev);
            if ri <= rp {
                // No rate growth: this pass can replace the top only if it
                // adds distortion for free.
                if di > dp {
                    if prev.is_some() {
                        stack.pop();
                        continue;
                    }
                } else {
                    break;
                }
            }
            let slope_in = (di - dp) / (ri - rp).max(f64::MIN_POSITIVE);
            let before = if stack.len() >= 2 {
                let (rq, dq) = point(cblk, Some(stack[stack.len() - 2]));
                (dp - dq) / (rp - rq).max(f64::MIN_POSITIVE)
            } else if stack.len() == 1 {
                (dp - 0.0) / rp.max(f64::MIN_POSITIVE)
            } else {
                f64::INFINITY
            };
            if slope_in >= before && !stack.is_empty() {
                stack.pop();
                continue;
            }
            break;
        }
        if di > point(cblk, stack.last().copied()).1 {
            stack.push(i);
        }
    }
    // Stamp the hull slopes.
    let mut prev: Option<usize> = None;
    for &i in &stack {
        let (rp, dp) = point(cblk, prev);
        let (ri, di) = point(cblk, Some(i));
        let slope = (di - dp) / (ri - rp).max(f64::MIN_POSITIVE);
        cblk.passes[i].slope = slope_index(slope).max(1);
        prev = Some(i);
    }
}

fn for_each_block(tile: &mut Tile, mut f: impl FnMut(&mut CodeBlock)) {
    for comp in &mut tile.comps {
        for res in &mut comp.resolutions {
            for band in &mut res.bands {
                for prc in &mut band.precincts {
                    for cblk in &mut prc.cblks {
                        f(cblk);
                    }
                }
            }
        }
    }
}

fn layer_needs_rate_control(tcp: &TileCodingParams, layno: usize) -> bool {
    tcp.rates.get(layno).copied().unwrap_or(0.0) > 0.0
        || tcp.distoratio.get(layno).copied().unwrap_or(0.0) > 0.0
}

fn needs_rate_control(tcp: &TileCodingParams) -> bool {
    (0..tcp.num_layers as usize).any(|l| layer_needs_rate_control(tcp, l))
}

/// Include in layer `layno` every pass whose hull slope exceeds `thresh`
/// (0 takes everything left); update lengths, data offsets and distortion.
pub fn make_layer_feasible(tile: &mut Tile, layno: usize, thresh: u16, final_pass: bool) {
    let mut disto = 0.0f64;
    for_each_block(tile, |cblk| {
        if layno == 0 {
            cblk.num_passes_included_in_previous_layers = 0;
        }
        let mut included = cblk.num_passes_included_in_previous_layers;
        for passno in cblk.num_passes_included_in_previous_layers..cblk.num_passes_encoded {
            let pass = cblk.passes[passno as usize];
            if pass.slope != 0 {
                if pass.slope <= thresh {
                    break;
                }
                included = passno + 1;
            }
        }
        disto += update_layer(cblk, layno, included, final_pass);
    });
    tile.distolayer[layno] = disto;
}

/// The simple variant of the primitive over raw slopes.
pub fn make_layer_simple(tile: &mut Tile, layno: usize, thresh: f64, final_pass: bool) {
    let mut disto = 0.0f64;
    for_each_block(tile, |cblk| {
        if layno == 0 {
            cblk.num_passes_included_in_previous_layers = 0;
            cblk.num_passes_included_in_current_layer = 0;
            cblk.numlenbits = 0;
        }
        let mut included = cblk.num_passes_included_in_previous_layers;
        if thresh == 0.0 {
            included = cblk.num_passes_encoded;
        } else {
            for passno in cblk.num_passes_included_in_previous_layers..cblk.num_passes_encoded {
                let pass = cblk.passes[passno as usize];
                let (dr, dd) = if included == 0 {
                    (pass.rate as f64, pass.distortiondec)
                } else {
                    let prev = cblk.passes[included as usize - 1];
                    (
                        pass.rate as f64 - prev.rate as f64,
                        pass.distortiondec - prev.distortiondec,
                    )
                };
                if dr == 0.0 {
                    if dd != 0.0 {
                        included = passno + 1;
                    }
                    continue;
                }
                if thresh - dd / dr < f64::EPSILON {
                    included = passno + 1;
                }
            }
        }
        disto += update_layer(cblk, layno, included, final_pass);
    });
    tile.distolayer[layno] = disto;
}

/// Dump every remaining pass into this layer.
pub fn make_layer_final(tile: &mut Tile, layno: usize) {
    let mut disto = 0.0f64;
    for_each_block(tile, |cblk| {
        if layno == 0 {
            cblk.num_passes_included_in_previous_layers = 0;
            cblk.num_passes_included_in_current_layer = 0;
            cblk.numlenbits = 0;
        }
        let included = cblk
            .num_passes_encoded
            .max(cblk.num_passes_included_in_previous_layers);
        disto += update_layer(cblk, layno, included, true);
    });
    tile.distolayer[layno] = disto;
}

fn update_layer(cblk: &mut CodeBlock, layno: usize, included: u32, final_pass: bool) -> f64 {
    let prev = cblk.num_passes_included_in_previous_layers;
    let layer = &mut cblk.layers[layno];
    layer.numpasses = included - prev;
    if layer.numpasses == 0 {
        layer.disto = 0.0;
        layer.len = 0;
        return 0.0;
    }
    let last = cblk.passes[included as usize - 1];
    if prev == 0 {
        layer.len = last.rate;
        layer.data_start = 0;
        layer.disto = last.distortiondec;
    } else {
        let before = cblk.passes[prev as usize - 1];
        layer.len = last.rate - before.rate;
        layer.data_start = before.rate;
        layer.disto = last.distortiondec - before.distortiondec;
    }
    let disto = layer.disto;
    if final_pass {
        cblk.num_passes_included_in_previous_layers = included;
    }
    disto
}

/// Tally `numpix` and the maximum squared error of the tile, shared by
/// both allocators.
fn tally(tile: &mut Tile, image: &Image) -> f64 {
    let mut max_se = 0.0f64;
    tile.numpix = 0;
    for (compno, comp) in tile.comps.iter_mut().enumerate() {
        comp.numpix = 0;
        for res in &comp.resolutions {
            for band in &res.bands {
                for prc in &band.precincts {
                    for cblk in &prc.cblks {
                        comp.numpix += cblk.rect.area();
                    }
                }
            }
        }
        tile.numpix += comp.numpix;
        let peak = f64::from((1u32 << image.components[compno].precision) - 1);
        max_se += peak * peak * comp.numpix as f64;
    }
    max_se
}

fn layer_byte_budget(tile: &Tile, tcp: &TileCodingParams, layno: usize, len: usize) -> usize {
    let rate = tcp.rates.get(layno).copied().unwrap_or(0.0);
    if rate <= 0.0 {
        return len;
    }
    let budget = (rate * tile.rect.area() as f64 / 8.0).ceil() as usize;
    budget.min(len)
}

/// Run the configured allocator. Returns false when some layer target was
/// infeasible (a best-effort layer is still in place).
pub fn allocate(
    tile: &mut Tile,
    tcp: &TileCodingParams,
    image: &Image,
    max_len: usize,
) -> Result<bool> {
    match tcp.rate_control {
        RateControlAlgorithm::Feasible => pcrd_bisect_feasible(tile, tcp, image, max_len),
        RateControlAlgorithm::Simple => pcrd_bisect_simple(tile, tcp, image, max_len),
    }
}

fn single_lossless(tile: &mut Tile, tcp: &TileCodingParams) -> bool {
    if tcp.num_layers == 1 && !layer_needs_rate_control(tcp, 0) {
        make_layer_final(tile, 0);
        true
    } else {
        false
    }
}

/// Bisection over convex-hull slope indices.
pub fn pcrd_bisect_feasible(
    tile: &mut Tile,
    tcp: &TileCodingParams,
    image: &Image,
    len: usize,
) -> Result<bool> {
    if single_lossless(tile, tcp) {
        return Ok(true);
    }
    let max_se = tally(tile, image);
    let mut min_slope = u16::MAX;
    for_each_block(tile, |cblk| {
        hull_one(cblk);
        for pass in &cblk.passes {
            if pass.slope > 0 {
                min_slope = min_slope.min(pass.slope);
            }
        }
    });
    if min_slope == u16::MAX {
        // Nothing was coded at all.
        for layno in 0..tcp.num_layers as usize {
            make_layer_final(tile, layno);
        }
        return Ok(true);
    }

    let mut feasible = true;
    let mut cumdisto = 0.0f64;
    let mut upper = u16::MAX as u32;
    for layno in 0..tcp.num_layers as usize {
        if !layer_needs_rate_control(tcp, layno) {
            make_layer_final(tile, layno);
            continue;
        }
        let mut lower = min_slope as u32;
        let maxlen = layer_byte_budget(tile, tcp, layno, len);
        let quality = tcp.distoratio.get(layno).copied().unwrap_or(0.0) > 0.0;
        let disto_target = if quality {
            tile.distotile
                - max_se / 10f64.powf(tcp.distoratio[layno] / 10.0)
        } else {
            0.0
        };

        let mut prev_thresh = 0u32;
        let mut fit_seen = false;
        for _ in 0..128 {
            let thresh = (lower + upper) >> 1;
            if prev_thresh != 0 && prev_thresh == thresh {
                break;
            }
            make_layer_feasible(tile, layno, thresh as u16, false);
            prev_thresh = thresh;
            if quality {
                let achieved = cumdisto + tile.distolayer[layno];
                if achieved < disto_target {
                    upper = thresh;
                    continue;
                }
                lower = thresh;
            } else {
                let fits = t2::encode_packets(
                    tile,
                    tcp,
                    image,
                    layno as u32 + 1,
                    maxlen,
                    true,
                    false,
                )
                .is_ok();
                if fits {
                    upper = thresh;
                    fit_seen = true;
                } else {
                    lower = thresh;
                }
            }
        }
        if !quality && !fit_seen {
            warn!("layer {layno}: no slope threshold satisfies the rate target");
            feasible = false;
        }
        let goodthresh = upper;
        make_layer_feasible(tile, layno, goodthresh as u16, true);
        cumdisto += tile.distolayer[layno];
        // The next layer searches below this layer's lower bound.
        upper = lower.saturating_sub(1).max(1);
    }
    Ok(feasible)
}

/// Bisection over raw distortion/rate slopes.
pub fn pcrd_bisect_simple(
    tile: &mut Tile,
    tcp: &TileCodingParams,
    image: &Image,
    len: usize,
) -> Result<bool> {
    if single_lossless(tile, tcp) {
        return Ok(true);
    }
    let max_se = tally(tile, image);
    let mut min_slope = f64::MAX;
    let mut max_slope = -1.0f64;
    for_each_block(tile, |cblk| {
        for passno in 0..cblk.num_passes_encoded as usize {
            let pass = cblk.passes[passno];
            let (dr, dd) = if passno == 0 {
                (pass.rate as f64, pass.distortiondec)
            } else {
                let prev = cblk.passes[passno - 1];
                (
                    pass.rate as f64 - prev.rate as f64,
                    pass.distortiondec - prev.distortiondec,
                )
            };
            if dr == 0.0 {
                continue;
            }
            let slope = dd / dr;
            min_slope = min_slope.min(slope);
            max_slope = max_slope.max(slope);
        }
    });
    if max_slope < 0.0 {
        for layno in 0..tcp.num_layers as usize {
            make_layer_final(tile, layno);
        }
        return Ok(true);
    }

    let mut feasible = true;
    let mut cumdisto = 0.0f64;
    let mut upper = max_slope;
    for layno in 0..tcp.num_layers as usize {
        if !layer_needs_rate_control(tcp, layno) {
            make_layer_simple(tile, layno, 0.0, true);
            continue;
        }
        let mut lower = min_slope;
        let maxlen = layer_byte_budget(tile, tcp, layno, len);
        let quality = tcp.distoratio.get(layno).copied().unwrap_or(0.0) > 0.0;
        let disto_target = if quality {
            tile.distotile
                - max_se / 10f64.powf(tcp.distoratio[layno] / 10.0)
        } else {
            0.0
        };

        let mut prev_thresh = -1.0f64;
        let mut thresh = lower;
        let mut fit_seen = false;
        for _ in 0..128 {
            thresh = if upper < 0.0 {
                lower
            } else {
                (lower + upper) / 2.0
            };
            make_layer_simple(tile, layno, thresh, false);
            if prev_thresh >= 0.0 && (prev_thresh - thresh).abs() < 0.001 {
                break;
            }
            prev_thresh = thresh;
            if quality {
                let achieved = cumdisto + tile.distolayer[layno];
                if achieved < disto_target {
                    upper = thresh;
                    continue;
                }
                lower = thresh;
            } else {
                let fits = t2::encode_packets(
                    tile,
                    tcp,
                    image,
                    layno as u32 + 1,
                    maxlen,
                    true,
                    false,
                )
                .is_ok();
                if fits {
                    upper = thresh;
                    fit_seen = true;
                } else {
                    lower = thresh;
                }
            }
        }
        if !quality && !fit_seen {
            warn!("layer {layno}: no slope threshold satisfies the rate target");
            feasible = false;
        }
        let goodthresh = if upper < 0.0 { thresh } else { upper };
        make_layer_simple(tile, layno, goodthresh, true);
        cumdisto += tile.distolayer[layno];
        upper = lower - 1.0;
    }
    Ok(feasible)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Rect;
    use crate::tile::EncPass;

    fn block_with_passes(rates: &[u32], distos: &[f64]) -> CodeBlock {
        let mut cblk = CodeBlock {
            rect: Rect::new(0, 0, 16, 16),
            ..Default::default()
        };
        cblk.reset_encode(1);
        for (i, (&r, &d)) in rates.iter().zip(distos).enumerate() {
            cblk.passes.push(EncPass {
                rate: r,
                distortiondec: d,
                len: if i == 0 { r } else { r - rates[i - 1] },
                term: false,
                slope: 0,
            });
        }
        cblk.num_passes_encoded = cblk.passes.len() as u32;
        cblk
    }

    #[test]
    fn test_hull_keeps_dominating_passes() {
        // Pass 1 is dominated: same rate step, less distortion gain than
        // the combined 0->2 line.
        let mut cblk = block_with_passes(&[10, 20, 30], &[100.0, 101.0, 200.0]);
        hull_one(&mut cblk);
        assert!(cblk.passes[0].slope > 0);
        assert_eq!(cblk.passes[1].slope, 0);
        assert!(cblk.passes[2].slope > 0);
        // Hull slopes decrease.
        assert!(cblk.passes[0].slope > cblk.passes[2].slope);
    }

    #[test]
    fn test_hull_monotone_block_all_kept() {
        let mut cblk = block_with_passes(&[10, 20, 30], &[300.0, 400.0, 450.0]);
        hull_one(&mut cblk);
        assert!(cblk.passes.iter().all(|p| p.slope > 0));
        assert!(cblk.passes[0].slope >= cblk.passes[1].slope);
        assert!(cblk.passes[1].slope >= cblk.passes[2].slope);
    }

    #[test]
    fn test_slope_index_monotone() {
        let a = slope_index(0.5);
        let b = slope_index(2.0);
        let c = slope_index(1000.0);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_update_layer_offsets() {
        let mut cblk = block_with_passes(&[10, 25, 40], &[10.0, 20.0, 30.0]);
        update_layer(&mut cblk, 0, 2, true);
        assert_eq!(cblk.layers[0].numpasses, 2);
        assert_eq!(cblk.layers[0].len, 25);
        assert_eq!(cblk.layers[0].data_start, 0);
        assert_eq!(cblk.num_passes_included_in_previous_layers, 2);

        cblk.layers.push(Default::default());
        update_layer(&mut cblk, 1, 3, true);
        assert_eq!(cblk.layers[1].numpasses, 1);
        assert_eq!(cblk.layers[1].len, 15);
        assert_eq!(cblk.layers[1].data_start, 25);
    }
}

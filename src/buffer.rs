//! Tile-component buffer: one contiguous store per component that serves
//! as sample memory and wavelet scratch, plus the window bookkeeping for
//! region decode.
//!
//! For windowed decode the requested output window is mapped down the
//! resolution pyramid, padded by the filter half-width at every level;
//! those per-resolution windows gate which precincts and code blocks are
//! decoded and bound the lifting ranges of the region transform.

use crate::dwt::RegionRanges;
use crate::math::Rect;

/// Map the full-resolution window down the pyramid. Index r holds the
/// window at resolution r, already padded by `margin` per level crossed
/// and clipped to the resolution bounds (global coordinates).
pub fn resolution_windows(res: &[Rect], numres: usize, win: Rect, margin: u32) -> Vec<Rect> {
    let mut wins = vec![Rect::default(); numres];
    if numres == 0 {
        return wins;
    }
    wins[numres - 1] = win.intersection(&res[numres - 1]);
    for r in (0..numres.saturating_sub(1)).rev() {
        wins[r] = wins[r + 1]
            .scaled_down(1)
            .padded(margin)
            .intersection(&res[r]);
    }
    wins
}

/// Window of a band in band coordinates, padded for the filter footprint.
pub fn band_window(res_windows: &[Rect], resno: usize, orient: u32, margin: u32) -> Rect {
    if resno == 0 || orient == 0 {
        return res_windows[0].padded(margin);
    }
    res_windows[resno].scaled_down(1).padded(margin)
}

/// Lifting ranges for each level transition of the windowed inverse
/// transform. Entry `level - 1` steers the pass that reconstructs
/// resolution `level`.
pub fn region_ranges(res: &[Rect], numres: usize, win: Rect, margin: u32) -> Vec<RegionRanges> {
    let wins = resolution_windows(res, numres, win, margin);
    let mut out = Vec::with_capacity(numres.saturating_sub(1));
    for level in 1..numres {
        let cur = res[level];
        let low = res[level - 1];
        let rw = cur.width() as i64;
        let rh = cur.height() as i64;
        let sn_h = low.width() as i64;
        let sn_v = low.height() as i64;
        let dn_h = rw - sn_h;
        let dn_v = rh - sn_v;
        let w = wins[level];

        let wx0 = w.x0.saturating_sub(cur.x0) as i64;
        let wx1 = (w.x1.saturating_sub(cur.x0) as i64).min(rw);
        let wy0 = w.y0.saturating_sub(cur.y0) as i64;
        let wy1 = (w.y1.saturating_sub(cur.y0) as i64).min(rh);
        let m = margin as i64;

        let ih = ((wx0 - m).max(0), (wx1 + m).min(rw));
        let iv = ((wy0 - m).max(0), (wy1 + m).min(rh));
        let h_even = ((ih.0 / 2 - 2).max(0), (ih.1 / 2 + 2).min(sn_h));
        let h_odd = ((ih.0 / 2 - 2).max(0), (ih.1 / 2 + 2).min(dn_h.max(0)));
        let v_even = ((iv.0 / 2 - 2).max(0), (iv.1 / 2 + 2).min(sn_v));
        let v_odd = ((iv.0 / 2 - 2).max(0), (iv.1 / 2 + 2).min(dn_v.max(0)));

        out.push(RegionRanges {
            h_even,
            h_odd,
            v_even,
            v_odd,
            ih,
            iv,
        });
    }
    out
}

/// Per-tile-component sample store. Reversible tiles live in the integer
/// plane, irreversible ones in the float plane; only one is active.
#[derive(Debug, Default)]
pub struct TileBuffer {
    pub width: usize,
    pub height: usize,
    pub is_float: bool,
    pub idata: Vec<i32>,
    pub fdata: Vec<f32>,
    /// Decode window in full-resolution tile-component coordinates
    /// (global), with the derived per-resolution windows.
    pub window: Option<Rect>,
    res_windows: Vec<Rect>,
    margin: u32,
}

impl TileBuffer {
    pub fn new(width: usize, height: usize, is_float: bool) -> Self {
        let len = width * height;
        Self {
            width,
            height,
            is_float,
            idata: if is_float { Vec::new() } else { vec![0; len] },
            fdata: if is_float { vec![0.0; len] } else { Vec::new() },
            window: None,
            res_windows: Vec::new(),
            margin: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adopt caller storage as the integer plane. The buffer grows it to
    /// the needed size if it arrives short.
    pub fn acquire_i32(&mut self, mut data: Vec<i32>) {
        data.resize(self.len(), 0);
        self.idata = data;
        self.is_float = false;
    }

    /// Hand the integer plane out, leaving the buffer empty.
    pub fn transfer_i32(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.idata)
    }

    pub fn reset(&mut self) {
        self.idata.iter_mut().for_each(|v| *v = 0);
        self.fdata.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Bind a decode window (full-resolution coordinates, global) and
    /// derive the per-resolution windows.
    pub fn set_window(&mut self, res: &[Rect], win: Rect, margin: u32) {
        self.margin = margin;
        self.res_windows = resolution_windows(res, res.len(), win, margin);
        self.window = Some(win);
    }

    pub fn clear_window(&mut self) {
        self.window = None;
        self.res_windows.clear();
    }

    /// Should work on this precinct happen at all under the current
    /// window? Precinct bounds are band coordinates.
    pub fn precinct_in_window(&self, resno: usize, orient: u32, prc: &Rect) -> bool {
        if self.window.is_none() || self.res_windows.is_empty() {
            return true;
        }
        let bw = band_window(&self.res_windows, resno, orient, self.margin);
        !bw.is_empty() && bw.intersects(prc)
    }

    /// Same test at code-block granularity.
    pub fn block_in_window(&self, resno: usize, orient: u32, blk: &Rect) -> bool {
        self.precinct_in_window(resno, orient, blk)
    }

    pub fn region_ranges_for(&self, res: &[Rect]) -> Option<Vec<RegionRanges>> {
        let win = self.window?;
        Some(region_ranges(res, res.len(), win, self.margin))
    }
}

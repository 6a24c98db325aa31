//! The tile lattice: tile, tile-components, resolutions, bands, precincts
//! and code blocks, with the geometry rules of B.5-B.7.
//!
//! Entities live in parallel vectors owned top-down; nothing points back
//! up. Coordinates are canvas-global until a code block is handed to the
//! block coder, which works band-relative.

use crate::coding_params::{CodingParams, TileCodingParams};
use crate::dwt;
use crate::error::{CodecError, Result};
use crate::image::Image;
use crate::math::{ceil_div, ceil_div_pow2, ceil_div_pow2_i64, floor_div_pow2, Rect};
use crate::quantization::band_stepsize;
use crate::tag_tree::TagTree;

/// One coding pass on the encode side.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncPass {
    /// Cumulative compressed byte count through this pass.
    pub rate: u32,
    /// Cumulative weighted distortion decrease.
    pub distortiondec: f64,
    pub len: u32,
    pub term: bool,
    /// Convex-hull slope index; 0 for dominated passes.
    pub slope: u16,
}

/// Contribution of a code block to one quality layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockLayer {
    pub numpasses: u32,
    pub len: u32,
    /// Offset of the layer bytes inside the block's compressed data.
    pub data_start: u32,
    pub disto: f64,
}

/// A run of passes between two terminations, on the decode side.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub numpasses: u32,
    pub maxpasses: u32,
    /// Passes contributed by the packet currently being read.
    pub numpasses_in_packet: u32,
    /// Byte length announced by the current packet header.
    pub newlen: u32,
    pub len: u32,
    pub dataindex: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CodeBlock {
    /// Bounds in band coordinates.
    pub rect: Rect,
    pub numbps: u32,
    pub numlenbits: u32,

    // Compress side.
    pub data: Vec<u8>,
    pub passes: Vec<EncPass>,
    pub num_passes_encoded: u32,
    pub num_passes_included_in_previous_layers: u32,
    pub num_passes_included_in_current_layer: u32,
    pub layers: Vec<BlockLayer>,

    // Decompress side.
    pub segments: Vec<Segment>,
    pub num_segments: usize,
    pub compressed: Vec<u8>,
    /// Passes announced for this block by the packet being read.
    pub num_passes_in_packet: u32,
    pub failed: bool,
}

impl CodeBlock {
    pub fn width(&self) -> u32 {
        self.rect.width()
    }

    pub fn height(&self) -> u32 {
        self.rect.height()
    }

    pub fn reset_encode(&mut self, num_layers: u32) {
        self.data.clear();
        self.passes.clear();
        self.num_passes_encoded = 0;
        self.num_passes_included_in_previous_layers = 0;
        self.num_passes_included_in_current_layer = 0;
        self.numlenbits = 0;
        self.numbps = 0;
        self.layers = vec![BlockLayer::default(); num_layers as usize];
    }

    pub fn reset_decode(&mut self) {
        self.segments.clear();
        self.num_segments = 0;
        self.compressed.clear();
        self.num_passes_in_packet = 0;
        self.numbps = 0;
        self.numlenbits = 0;
        self.failed = false;
    }
}

#[derive(Debug, Clone)]
pub struct Precinct {
    pub rect: Rect,
    /// Code-block grid inside this precinct.
    pub cw: u32,
    pub ch: u32,
    pub cblks: Vec<CodeBlock>,
    pub incl_tree: TagTree,
    pub imsb_tree: TagTree,
}

#[derive(Debug, Clone)]
pub struct Band {
    /// 0 = LL, 1 = HL, 2 = LH, 3 = HH.
    pub orient: u32,
    pub rect: Rect,
    /// Dynamic range signalled for the band: expn + guard bits - 1.
    pub numbps: u32,
    pub stepsize: f32,
    pub precincts: Vec<Precinct>,
}

impl Band {
    pub fn is_empty(&self) -> bool {
        self.rect.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub rect: Rect,
    /// Precinct grid at this resolution.
    pub pw: u32,
    pub ph: u32,
    pub bands: Vec<Band>,
}

impl Resolution {
    pub fn num_precincts(&self) -> u32 {
        self.pw * self.ph
    }
}

#[derive(Debug, Clone)]
pub struct TileComponent {
    pub rect: Rect,
    pub num_resolutions: u32,
    pub resolutions: Vec<Resolution>,
    /// Samples counted toward the rate budget.
    pub numpix: u64,
}

impl TileComponent {
    pub fn width(&self) -> u32 {
        self.rect.width()
    }

    pub fn height(&self) -> u32 {
        self.rect.height()
    }

    /// Resolution bounds from the lowest resolution up, as the wavelet
    /// stages consume them.
    pub fn resolution_rects(&self) -> Vec<Rect> {
        self.resolutions.iter().map(|r| r.rect).collect()
    }

    /// Offset of a band's code block inside the tile-component buffer,
    /// where each resolution keeps its low half in the top-left.
    pub fn block_offset(&self, resno: usize, orient: u32, block: &Rect) -> (u32, u32) {
        let band_rect = self
            .resolutions[resno]
            .bands
            .iter()
            .find(|b| b.orient == orient)
            .map(|b| b.rect)
            .unwrap_or_default();
        let mut x = block.x0 - band_rect.x0;
        let mut y = block.y0 - band_rect.y0;
        if orient & 1 != 0 {
            let prev = &self.resolutions[resno - 1];
            x += prev.rect.width();
        }
        if orient & 2 != 0 {
            let prev = &self.resolutions[resno - 1];
            y += prev.rect.height();
        }
        (x, y)
    }
}

#[derive(Debug, Clone)]
pub struct Tile {
    pub index: u32,
    pub rect: Rect,
    pub comps: Vec<TileComponent>,
    /// Total weighted distortion of the tile before truncation.
    pub distotile: f64,
    pub distolayer: Vec<f64>,
    pub numpix: u64,
    pub packno: u32,
}

/// Number of tiles on each axis of the grid.
pub fn tile_grid(image: &Image, params: &CodingParams) -> (u32, u32) {
    let tdx = if params.tile_width == 0 {
        image.x1 - params.tile_x0
    } else {
        params.tile_width
    };
    let tdy = if params.tile_height == 0 {
        image.y1 - params.tile_y0
    } else {
        params.tile_height
    };
    (
        ceil_div(image.x1 - params.tile_x0, tdx),
        ceil_div(image.y1 - params.tile_y0, tdy),
    )
}

/// Build the full lattice for one tile.
///
/// `fraction` scales the reconstructed band step sizes: 1.0 while
/// compressing, 0.5 while decompressing (the block decoder leaves a spare
/// low bit in its magnitudes).
pub fn init_tile(
    image: &Image,
    params: &CodingParams,
    tcp: &TileCodingParams,
    tile_index: u32,
    fraction: f32,
) -> Result<Tile> {
    let (tw, th) = tile_grid(image, params);
    if tile_index >= tw * th {
        return Err(CodecError::OutOfBounds(format!(
            "tile {tile_index} outside the {tw}x{th} grid"
        )));
    }
    let tdx = if params.tile_width == 0 {
        image.x1 - params.tile_x0
    } else {
        params.tile_width
    };
    let tdy = if params.tile_height == 0 {
        image.y1 - params.tile_y0
    } else {
        params.tile_height
    };
    let p = tile_index % tw;
    let q = tile_index / tw;
    let tx0 = params.tile_x0 + p * tdx;
    let ty0 = params.tile_y0 + q * tdy;
    let tile_rect = Rect {
        x0: tx0.max(image.x0),
        y0: ty0.max(image.y0),
        x1: tx0.saturating_add(tdx).min(image.x1),
        y1: ty0.saturating_add(tdy).min(image.y1),
    };
    if tile_rect.is_empty() {
        return Err(CodecError::OutOfBounds(format!(
            "tile {tile_index} has no canvas area"
        )));
    }

    let mut comps = Vec::with_capacity(image.components.len());
    for (compno, img_comp) in image.components.iter().enumerate() {
        let tccp = &tcp.components[compno];
        if img_comp.dx == 0 || img_comp.dy == 0 {
            return Err(CodecError::InconsistentParams(format!(
                "component {compno} has zero subsampling"
            )));
        }
        let comp_rect = Rect {
            x0: ceil_div(tile_rect.x0, img_comp.dx),
            y0: ceil_div(tile_rect.y0, img_comp.dy),
            x1: ceil_div(tile_rect.x1, img_comp.dx),
            y1: ceil_div(tile_rect.y1, img_comp.dy),
        };
        let numres = tccp.num_resolutions;
        let mut resolutions = Vec::with_capacity(numres as usize);
        let mut band_index = 0usize;
        for resno in 0..numres {
            let level = numres - 1 - resno;
            let res_rect = Rect {
                x0: ceil_div_pow2(comp_rect.x0, level),
                y0: ceil_div_pow2(comp_rect.y0, level),
                x1: ceil_div_pow2(comp_rect.x1, level),
                y1: ceil_div_pow2(comp_rect.y1, level),
            };
            let (pdx, pdy) = tccp.precincts[resno as usize];
            let tl_px = floor_div_pow2(res_rect.x0, pdx) << pdx;
            let tl_py = floor_div_pow2(res_rect.y0, pdy) << pdy;
            let br_px = ceil_div_pow2(res_rect.x1, pdx) << pdx;
            let br_py = ceil_div_pow2(res_rect.y1, pdy) << pdy;
            let pw = if res_rect.x0 == res_rect.x1 {
                0
            } else {
                (br_px - tl_px) >> pdx
            };
            let ph = if res_rect.y0 == res_rect.y1 {
                0
            } else {
                (br_py - tl_py) >> pdy
            };

            let (cbg_tlx, cbg_tly, cbgw_exp, cbgh_exp, num_bands) = if resno == 0 {
                (tl_px, tl_py, pdx, pdy, 1)
            } else {
                (
                    ceil_div_pow2(tl_px, 1),
                    ceil_div_pow2(tl_py, 1),
                    pdx - 1,
                    pdy - 1,
                    3,
                )
            };
            let cblkw_exp = tccp.cblk_w_exp.min(cbgw_exp);
            let cblkh_exp = tccp.cblk_h_exp.min(cbgh_exp);

            let mut bands = Vec::with_capacity(num_bands);
            for bandno in 0..num_bands {
                let orient = if resno == 0 { 0 } else { bandno as u32 + 1 };
                let band_rect = if resno == 0 {
                    res_rect
                } else {
                    let x0b = (orient & 1) as i64;
                    let y0b = (orient >> 1) as i64;
                    Rect {
                        x0: ceil_div_pow2_i64(
                            comp_rect.x0 as i64 - (x0b << level),
                            level + 1,
                        ),
                        y0: ceil_div_pow2_i64(
                            comp_rect.y0 as i64 - (y0b << level),
                            level + 1,
                        ),
                        x1: ceil_div_pow2_i64(
                            comp_rect.x1 as i64 - (x0b << level),
                            level + 1,
                        ),
                        y1: ceil_div_pow2_i64(
                            comp_rect.y1 as i64 - (y0b << level),
                            level + 1,
                        ),
                    }
                };

                let gain = if tccp.qmfbid == 0 {
                    dwt::gain_97(orient)
                } else {
                    dwt::gain_53(orient)
                };
                let (mant, expn) = *tccp.step_sizes.get(band_index).ok_or_else(|| {
                    CodecError::InconsistentParams(format!(
                        "missing step size for band {band_index} of component {compno}"
                    ))
                })?;
                let numbps_dyn = img_comp.precision + gain;
                let stepsize = band_stepsize(mant, expn, numbps_dyn, fraction);
                let band_numbps = expn + tccp.num_guard_bits - 1;
                band_index += 1;

                let mut precincts = Vec::with_capacity((pw * ph) as usize);
                for precno in 0..pw * ph {
                    let cbg_x = cbg_tlx + (precno % pw.max(1)) * (1 << cbgw_exp);
                    let cbg_y = cbg_tly + (precno / pw.max(1)) * (1 << cbgh_exp);
                    let prc_rect = Rect {
                        x0: cbg_x.max(band_rect.x0),
                        y0: cbg_y.max(band_rect.y0),
                        x1: (cbg_x + (1 << cbgw_exp)).min(band_rect.x1),
                        y1: (cbg_y + (1 << cbgh_exp)).min(band_rect.y1),
                    };
                    let tl_cx = floor_div_pow2(prc_rect.x0, cblkw_exp) << cblkw_exp;
                    let tl_cy = floor_div_pow2(prc_rect.y0, cblkh_exp) << cblkh_exp;
                    let br_cx = ceil_div_pow2(prc_rect.x1, cblkw_exp) << cblkw_exp;
                    let br_cy = ceil_div_pow2(prc_rect.y1, cblkh_exp) << cblkh_exp;
                    let cw = if prc_rect.is_empty() {
                        0
                    } else {
                        (br_cx - tl_cx) >> cblkw_exp
                    };
                    let ch = if prc_rect.is_empty() {
                        0
                    } else {
                        (br_cy - tl_cy) >> cblkh_exp
                    };

                    let mut cblks = Vec::with_capacity((cw * ch) as usize);
                    for cblkno in 0..cw * ch {
                        let cx = tl_cx + (cblkno % cw.max(1)) * (1 << cblkw_exp);
                        let cy = tl_cy + (cblkno / cw.max(1)) * (1 << cblkh_exp);
                        let cblk_rect = Rect {
                            x0: cx.max(prc_rect.x0),
                            y0: cy.max(prc_rect.y0),
                            x1: (cx + (1 << cblkw_exp)).min(prc_rect.x1),
                            y1: (cy + (1 << cblkh_exp)).min(prc_rect.y1),
                        };
                        cblks.push(CodeBlock {
                            rect: cblk_rect,
                            ..Default::default()
                        });
                    }
                    precincts.push(Precinct {
                        rect: prc_rect,
                        cw,
                        ch,
                        cblks,
                        incl_tree: TagTree::new(cw, ch),
                        imsb_tree: TagTree::new(cw, ch),
                    });
                }
                bands.push(Band {
                    orient,
                    rect: band_rect,
                    numbps: band_numbps,
                    stepsize,
                    precincts,
                });
            }
            resolutions.push(Resolution {
                rect: res_rect,
                pw,
                ph,
                bands,
            });
        }
        comps.push(TileComponent {
            rect: comp_rect,
            num_resolutions: numres,
            resolutions,
            numpix: 0,
        });
    }

    Ok(Tile {
        index: tile_index,
        rect: tile_rect,
        comps,
        distotile: 0.0,
        distolayer: vec![0.0; tcp.num_layers as usize],
        numpix: 0,
        packno: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageComponent;
    use crate::quantization::calc_explicit_stepsizes;

    fn build(w: u32, h: u32, numres: u32) -> Tile {
        let image = Image::new(w, h, vec![ImageComponent::new(w, h, 8, false)]);
        let params = CodingParams {
            num_resolutions: numres,
            ..Default::default()
        };
        let mut tcp = TileCodingParams::from_params(&params, 1);
        for comp in &mut tcp.components {
            calc_explicit_stepsizes(comp, 8);
        }
        init_tile(&image, &params, &tcp, 0, 1.0).unwrap()
    }

    #[test]
    fn test_band_structure() {
        let tile = build(64, 64, 3);
        let comp = &tile.comps[0];
        assert_eq!(comp.resolutions.len(), 3);
        assert_eq!(comp.resolutions[0].bands.len(), 1);
        assert_eq!(comp.resolutions[0].bands[0].orient, 0);
        for resno in 1..3 {
            let orients: Vec<u32> = comp.resolutions[resno]
                .bands
                .iter()
                .map(|b| b.orient)
                .collect();
            assert_eq!(orients, vec![1, 2, 3]);
        }
        // 64x64 with 3 resolutions: LL is 16x16.
        assert_eq!(comp.resolutions[0].rect.width(), 16);
        assert_eq!(comp.resolutions[2].rect.width(), 64);
    }

    #[test]
    fn test_band_origin_identity() {
        // band.x0 == ceildivpow2(tilec.x0 - x0b * 2^(level), level + 1)
        let image = Image::new(100, 90, vec![ImageComponent::new(100, 90, 8, false)]);
        let params = CodingParams {
            num_resolutions: 4,
            tile_width: 60,
            tile_height: 50,
            ..Default::default()
        };
        let mut tcp = TileCodingParams::from_params(&params, 1);
        for comp in &mut tcp.components {
            calc_explicit_stepsizes(comp, 8);
        }
        let tile = init_tile(&image, &params, &tcp, 3, 1.0).unwrap();
        let comp = &tile.comps[0];
        for (resno, res) in comp.resolutions.iter().enumerate().skip(1) {
            let level = 4 - 1 - resno as u32;
            for band in &res.bands {
                let x0b = (band.orient & 1) as i64;
                let y0b = (band.orient >> 1) as i64;
                assert_eq!(
                    band.rect.x0,
                    ceil_div_pow2_i64(comp.rect.x0 as i64 - (x0b << level), level + 1)
                );
                assert_eq!(
                    band.rect.y0,
                    ceil_div_pow2_i64(comp.rect.y0 as i64 - (y0b << level), level + 1)
                );
            }
        }
    }

    #[test]
    fn test_precinct_covers_blocks() {
        let tile = build(70, 50, 4);
        for comp in &tile.comps {
            for res in &comp.resolutions {
                for band in &res.bands {
                    for prc in &band.precincts {
                        assert_eq!(prc.cblks.len(), (prc.cw * prc.ch) as usize);
                        for cblk in &prc.cblks {
                            let inter = cblk.rect.intersection(&prc.rect);
                            assert_eq!(inter, cblk.rect);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_block_offset_quadrants() {
        let tile = build(64, 64, 2);
        let comp = &tile.comps[0];
        let res1 = &comp.resolutions[1];
        // The HL band of resolution 1 starts after the 32-wide low half.
        let hl = &res1.bands[0];
        assert_eq!(hl.orient, 1);
        let blk = hl.precincts[0].cblks[0].rect;
        let (x, y) = comp.block_offset(1, 1, &blk);
        assert_eq!(x, 32);
        assert_eq!(y, 0);
        let hh = &res1.bands[2];
        let blk = hh.precincts[0].cblks[0].rect;
        let (x, y) = comp.block_offset(1, 3, &blk);
        assert_eq!(x, 32);
        assert_eq!(y, 32);
    }

    #[test]
    fn test_bad_tile_index_rejected() {
        let image = Image::new(64, 64, vec![ImageComponent::new(64, 64, 8, false)]);
        let params = CodingParams::default();
        let mut tcp = TileCodingParams::from_params(&params, 1);
        for comp in &mut tcp.components {
            calc_explicit_stepsizes(comp, 8);
        }
        assert!(init_tile(&image, &params, &tcp, 1, 1.0).is_err());
    }
}

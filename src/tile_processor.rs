//! Tile processor: drives DC shift, component transform, wavelet
//! transform, block coding, rate allocation and packet assembly for one
//! tile, in both directions.
//!
//! Tier-1 fans out across code blocks on the pool; a failing block is
//! recorded, the remaining blocks are drained without decoding, and the
//! tile is marked invalid. Component buffers stay integer for reversible
//! tiles and float for irreversible ones.

use rayon::prelude::*;

use crate::buffer::TileBuffer;
use crate::coding_params::{CodingParams, MctMode, TileCodingParams};
use crate::error::{CodecError, Result};
use crate::image::Image;
use crate::math::{ceil_div, Rect};
use crate::mct;
use crate::quantization::{calc_explicit_stepsizes, dc_offset, sample_range};
use crate::rate_control;
use crate::t1::{SampleSink, SampleSource, T1Coder};
use crate::t2;
use crate::tile::{init_tile, Tile};
use crate::dwt;

/// Filter half-width used to pad decode windows.
fn filter_margin(irreversible: bool) -> u32 {
    if irreversible {
        4
    } else {
        2
    }
}

/// Output of one tile's encode.
#[derive(Debug, Default)]
pub struct CompressedTile {
    pub bytes: Vec<u8>,
    /// Per-packet byte counts when packet-length collection is on.
    pub packet_lengths: Vec<u32>,
    /// A rate target could not be met; layers are best-effort.
    pub rate_infeasible: bool,
}

pub struct TileProcessor {
    pub tile: Tile,
    pub tcp: TileCodingParams,
    pub buffers: Vec<TileBuffer>,
    /// Cleared when a decode left the tile partially populated.
    pub valid: bool,
    irreversible: bool,
    subsampling: Vec<(u32, u32)>,
}

impl TileProcessor {
    /// Build the lattice and buffers for encoding one tile.
    pub fn new_encode(image: &Image, params: &CodingParams, tile_index: u32) -> Result<Self> {
        Self::new(image, params, tile_index, 1.0)
    }

    /// Build the lattice and buffers for decoding one tile.
    pub fn new_decode(image: &Image, params: &CodingParams, tile_index: u32) -> Result<Self> {
        Self::new(image, params, tile_index, 0.5)
    }

    fn new(image: &Image, params: &CodingParams, tile_index: u32, fraction: f32) -> Result<Self> {
        params.validate(image.components.len())?;
        let mut tcp = TileCodingParams::from_params(params, image.components.len());
        for (compno, comp) in tcp.components.iter_mut().enumerate() {
            calc_explicit_stepsizes(comp, image.components[compno].precision);
        }
        let tile = init_tile(image, params, &tcp, tile_index, fraction)?;
        let irreversible = params.irreversible;
        let buffers = tile
            .comps
            .iter()
            .map(|comp| {
                TileBuffer::new(comp.width() as usize, comp.height() as usize, irreversible)
            })
            .collect();
        let subsampling = image.components.iter().map(|c| (c.dx, c.dy)).collect();
        Ok(Self {
            tile,
            tcp,
            buffers,
            valid: true,
            irreversible,
            subsampling,
        })
    }

    /// Restrict decoding to a window given in canvas coordinates.
    pub fn set_window(&mut self, window: Rect) {
        let margin = filter_margin(self.irreversible);
        let comp_windows: Vec<(Rect, Vec<Rect>)> = self
            .tile
            .comps
            .iter()
            .enumerate()
            .map(|(compno, comp)| {
                let (dx, dy) = self.subsampling[compno];
                let comp_win = Rect {
                    x0: ceil_div(window.x0, dx),
                    y0: ceil_div(window.y0, dy),
                    x1: ceil_div(window.x1, dx),
                    y1: ceil_div(window.y1, dy),
                };
                (comp_win, comp.resolution_rects())
            })
            .collect();
        for (compno, (comp_win, res_rects)) in comp_windows.into_iter().enumerate() {
            self.buffers[compno].set_window(&res_rects, comp_win, margin);
        }
    }

    // ----- compress --------------------------------------------------------

    /// Run the whole compress pipeline for this tile.
    pub fn encode_tile(
        &mut self,
        image: &Image,
        params: &CodingParams,
        max_len: usize,
    ) -> Result<CompressedTile> {
        self.copy_tile_data(image)?;
        self.encode_tile_prefilled(image, params, max_len)
    }

    /// As `encode_tile`, but with the component buffers already loaded
    /// (tile-by-tile push mode).
    pub fn encode_tile_prefilled(
        &mut self,
        image: &Image,
        params: &CodingParams,
        max_len: usize,
    ) -> Result<CompressedTile> {
        self.forward_dc_shift(image);
        self.forward_mct();
        self.forward_dwt();
        self.encode_blocks();
        let feasible = rate_control::allocate(&mut self.tile, &self.tcp, image, max_len)?;
        let stream = t2::encode_packets(
            &mut self.tile,
            &self.tcp,
            image,
            self.tcp.num_layers,
            max_len,
            false,
            params.write_plt,
        )?;
        Ok(CompressedTile {
            bytes: stream.bytes,
            packet_lengths: stream.packet_lengths,
            rate_infeasible: !feasible,
        })
    }

    /// Pull the tile's samples out of the caller's image.
    fn copy_tile_data(&mut self, image: &Image) -> Result<()> {
        for (compno, comp) in self.tile.comps.iter().enumerate() {
            let img_comp = &image.components[compno];
            let comp_x0 = ceil_div(image.x0, img_comp.dx) as usize;
            let comp_y0 = ceil_div(image.y0, img_comp.dy) as usize;
            let buf = &mut self.buffers[compno];
            let w = comp.width() as usize;
            for y in 0..comp.height() as usize {
                let src_y = comp.rect.y0 as usize + y - comp_y0;
                let src_x = comp.rect.x0 as usize - comp_x0;
                let start = src_y * img_comp.width as usize + src_x;
                if start + w > img_comp.data.len() {
                    return Err(CodecError::OutOfBounds(format!(
                        "tile reads past component {compno} samples"
                    )));
                }
                let src = &img_comp.data[start..start + w];
                if self.irreversible {
                    for (x, &v) in src.iter().enumerate() {
                        buf.fdata[y * w + x] = v as f32;
                    }
                } else {
                    buf.idata[y * w..y * w + w].copy_from_slice(src);
                }
            }
        }
        Ok(())
    }

    fn forward_dc_shift(&mut self, image: &Image) {
        for (compno, img_comp) in image.components.iter().enumerate() {
            let shift = dc_offset(img_comp.precision, img_comp.signed);
            if shift == 0 {
                continue;
            }
            let buf = &mut self.buffers[compno];
            if self.irreversible {
                let s = shift as f32;
                buf.fdata.iter_mut().for_each(|v| *v -= s);
            } else {
                buf.idata.iter_mut().for_each(|v| *v -= shift);
            }
        }
    }

    fn forward_mct(&mut self) {
        match self.tcp.mct {
            MctMode::None => {}
            MctMode::Standard => {
                if self.buffers.len() < 3 || !same_dims(&self.buffers[..3]) {
                    log::warn!("component transform skipped: first three components differ");
                    return;
                }
                let (a, rest) = self.buffers.split_at_mut(1);
                let (b, c) = rest.split_at_mut(1);
                if self.irreversible {
                    mct::forward_ict(&mut a[0].fdata, &mut b[0].fdata, &mut c[0].fdata);
                } else {
                    mct::forward_rct(&mut a[0].idata, &mut b[0].idata, &mut c[0].idata);
                }
            }
            MctMode::Custom => {
                if !self.irreversible {
                    log::warn!("custom component transform requires the irreversible path");
                    return;
                }
                let matrix = self.tcp.custom_mct_matrix.clone();
                let mut planes: Vec<&mut [f32]> = self
                    .buffers
                    .iter_mut()
                    .map(|b| b.fdata.as_mut_slice())
                    .collect();
                mct::forward_custom(&matrix, &mut planes);
            }
        }
    }

    fn forward_dwt(&mut self) {
        for (compno, comp) in self.tile.comps.iter().enumerate() {
            let res = comp.resolution_rects();
            let buf = &mut self.buffers[compno];
            let stride = buf.width;
            if self.irreversible {
                dwt::encode_97(&mut buf.fdata, stride, &res);
            } else {
                dwt::encode_53(&mut buf.idata, stride, &res);
            }
        }
    }

    fn encode_blocks(&mut self) {
        let irreversible = self.irreversible;
        let mct_applied = self.tcp.mct == MctMode::Standard;
        let track = rate_control_needed(&self.tcp);
        let num_layers = self.tcp.num_layers;
        let mut total_disto = 0.0f64;
        for (compno, comp) in self.tile.comps.iter_mut().enumerate() {
            let tccp = &self.tcp.components[compno];
            let buf = &self.buffers[compno];
            let stride = buf.width;
            let num_res = comp.num_resolutions;
            let mct_norm = mct::norm_for(mct_applied, irreversible, compno);
            let roi_shift = tccp.roi_shift;
            let cblk_sty = tccp.cblk_sty;
            let qmfbid = tccp.qmfbid;

            let prev_dims: Vec<(u32, u32)> = comp
                .resolutions
                .iter()
                .map(|r| (r.rect.width(), r.rect.height()))
                .collect();

            for (resno, res) in comp.resolutions.iter_mut().enumerate() {
                let level = num_res - 1 - resno as u32;
                for band in &mut res.bands {
                    let orient = band.orient;
                    let band_rect = band.rect;
                    let stepsize = band.stepsize;
                    for prc in &mut band.precincts {
                        let disto: f64 = prc
                            .cblks
                            .par_iter_mut()
                            .map_init(T1Coder::new, |t1, cblk| {
                                cblk.reset_encode(num_layers);
                                let mut x = cblk.rect.x0 - band_rect.x0;
                                let mut y = cblk.rect.y0 - band_rect.y0;
                                if orient & 1 != 0 {
                                    x += prev_dims[resno - 1].0;
                                }
                                if orient & 2 != 0 {
                                    y += prev_dims[resno - 1].1;
                                }
                                let src = if irreversible {
                                    SampleSource::Float(&buf.fdata)
                                } else {
                                    SampleSource::Int(&buf.idata)
                                };
                                t1.encode_block(
                                    cblk,
                                    orient,
                                    level,
                                    qmfbid,
                                    stepsize,
                                    cblk_sty,
                                    mct_norm,
                                    roi_shift,
                                    src,
                                    stride,
                                    (x as usize, y as usize),
                                    track,
                                )
                            })
                            .sum();
                        total_disto += disto;
                    }
                }
            }
        }
        self.tile.distotile = total_disto;
    }

    // ----- decompress ------------------------------------------------------

    /// Run the whole decompress pipeline over one tile part.
    pub fn decode_tile(&mut self, image: &mut Image, src: &[u8]) -> Result<()> {
        t2::decode_packets(&mut self.tile, &self.tcp, image, &self.buffers, src)?;
        self.decode_blocks();
        self.inverse_dwt();
        self.inverse_mct();
        self.inverse_dc_shift(image);
        self.update_tile_data(image)?;
        Ok(())
    }

    fn decode_blocks(&mut self) {
        use std::sync::atomic::{AtomicBool, Ordering};
        let any_failed = AtomicBool::new(false);
        for (compno, comp) in self.tile.comps.iter_mut().enumerate() {
            let tccp = &self.tcp.components[compno];
            let cblk_sty = tccp.cblk_sty;
            let roi_shift = tccp.roi_shift;
            let qmfbid = tccp.qmfbid;
            let buf = &mut self.buffers[compno];
            let stride = buf.width;

            let prev_dims: Vec<(u32, u32)> = comp
                .resolutions
                .iter()
                .map(|r| (r.rect.width(), r.rect.height()))
                .collect();

            for (resno, res) in comp.resolutions.iter_mut().enumerate() {
                for band in &mut res.bands {
                    let orient = band.orient;
                    let band_rect = band.rect;
                    let stepsize = band.stepsize;
                    for prc in &mut band.precincts {
                        let in_win: Vec<bool> = prc
                            .cblks
                            .iter()
                            .map(|c| buf.block_in_window(resno, orient, &c.rect))
                            .collect();
                        // Decode blocks in parallel into their own buffers,
                        // then scatter serially into the shared plane.
                        let decoded: Vec<Option<Vec<i32>>> = prc
                            .cblks
                            .par_iter_mut()
                            .enumerate()
                            .map_init(T1Coder::new, |t1, (cblkno, cblk)| {
                                if cblk.failed
                                    || !in_win[cblkno]
                                    || any_failed.load(Ordering::Relaxed)
                                {
                                    return None;
                                }
                                if t1.decode_block(cblk, orient, cblk_sty) {
                                    Some(std::mem::take(&mut t1.dec_data))
                                } else {
                                    cblk.failed = true;
                                    any_failed.store(true, Ordering::Relaxed);
                                    None
                                }
                            })
                            .collect();
                        for (cblkno, data) in decoded.into_iter().enumerate() {
                            let Some(data) = data else { continue };
                            let cblk = &prc.cblks[cblkno];
                            let mut x = cblk.rect.x0 - band_rect.x0;
                            let mut y = cblk.rect.y0 - band_rect.y0;
                            if orient & 1 != 0 {
                                x += prev_dims[resno - 1].0;
                            }
                            if orient & 2 != 0 {
                                y += prev_dims[resno - 1].1;
                            }
                            let sink = if qmfbid == 1 {
                                SampleSink::Int(&mut buf.idata)
                            } else {
                                SampleSink::Float(&mut buf.fdata)
                            };
                            T1Coder::post_decode(
                                &data,
                                cblk.rect.width() as usize,
                                cblk.rect.height() as usize,
                                roi_shift,
                                stepsize,
                                sink,
                                stride,
                                (x as usize, y as usize),
                            );
                        }
                    }
                }
            }
        }
        if any_failed.load(std::sync::atomic::Ordering::Relaxed) {
            self.valid = false;
        }
    }

    fn inverse_dwt(&mut self) {
        for (compno, comp) in self.tile.comps.iter().enumerate() {
            let res = comp.resolution_rects();
            let numres = res.len();
            let buf = &mut self.buffers[compno];
            let stride = buf.width;
            let ranges = buf.region_ranges_for(&res);
            match (self.irreversible, ranges) {
                (false, None) => dwt::decode_53(&mut buf.idata, stride, &res, numres),
                (false, Some(rr)) => {
                    dwt::decode_53_region(&mut buf.idata, stride, &res, numres, &rr)
                }
                (true, None) => dwt::decode_97(&mut buf.fdata, stride, &res, numres),
                (true, Some(rr)) => {
                    dwt::decode_97_region(&mut buf.fdata, stride, &res, numres, &rr)
                }
            }
        }
    }

    fn inverse_mct(&mut self) {
        match self.tcp.mct {
            MctMode::None => {}
            MctMode::Standard => {
                if self.buffers.len() < 3 || !same_dims(&self.buffers[..3]) {
                    return;
                }
                let (a, rest) = self.buffers.split_at_mut(1);
                let (b, c) = rest.split_at_mut(1);
                if self.irreversible {
                    mct::inverse_ict(&mut a[0].fdata, &mut b[0].fdata, &mut c[0].fdata);
                } else {
                    mct::inverse_rct(&mut a[0].idata, &mut b[0].idata, &mut c[0].idata);
                }
            }
            MctMode::Custom => {
                if !self.irreversible {
                    return;
                }
                let matrix = self.tcp.custom_mct_matrix.clone();
                let mut planes: Vec<&mut [f32]> = self
                    .buffers
                    .iter_mut()
                    .map(|b| b.fdata.as_mut_slice())
                    .collect();
                if !mct::inverse_custom(&matrix, &mut planes) {
                    log::warn!("custom component transform matrix is singular");
                    self.valid = false;
                }
            }
        }
    }

    fn inverse_dc_shift(&mut self, image: &Image) {
        for (compno, img_comp) in image.components.iter().enumerate() {
            let shift = dc_offset(img_comp.precision, img_comp.signed);
            let (lo, hi) = sample_range(img_comp.precision, img_comp.signed);
            let buf = &mut self.buffers[compno];
            if self.irreversible {
                let s = shift as f32;
                buf.idata = buf
                    .fdata
                    .iter()
                    .map(|&v| (v + s + 0.5).floor().clamp(lo as f32, hi as f32) as i32)
                    .collect();
            } else {
                for v in buf.idata.iter_mut() {
                    *v = (*v + shift).clamp(lo, hi);
                }
            }
        }
    }

    /// Push decoded samples back into the output image, honouring the
    /// decode window when one is set.
    fn update_tile_data(&mut self, image: &mut Image) -> Result<()> {
        for (compno, comp) in self.tile.comps.iter().enumerate() {
            let img_comp = &mut image.components[compno];
            let comp_x0 = ceil_div(image.x0, img_comp.dx) as usize;
            let comp_y0 = ceil_div(image.y0, img_comp.dy) as usize;
            let buf = &self.buffers[compno];
            let w = comp.width() as usize;
            let win = buf.window.unwrap_or(comp.rect);
            let copy_rect = win.intersection(&comp.rect);
            if copy_rect.is_empty() {
                continue;
            }
            for y in copy_rect.y0..copy_rect.y1 {
                let local_y = (y - comp.rect.y0) as usize;
                let dst_y = y as usize - comp_y0;
                for x in copy_rect.x0..copy_rect.x1 {
                    let local_x = (x - comp.rect.x0) as usize;
                    let dst_x = x as usize - comp_x0;
                    let dst_idx = dst_y * img_comp.width as usize + dst_x;
                    if dst_idx >= img_comp.data.len() {
                        return Err(CodecError::OutOfBounds(format!(
                            "decoded tile writes past component {compno}"
                        )));
                    }
                    img_comp.data[dst_idx] = buf.idata[local_y * w + local_x];
                }
            }
        }
        Ok(())
    }

    // ----- raw sample transfer ---------------------------------------------

    /// Load tile samples from packed bytes (1, 2 or 4 bytes per sample,
    /// little-endian, caller-declared signedness), components planar.
    pub fn copy_tile_data_packed(
        &mut self,
        src: &[u8],
        bytes_per_sample: usize,
        signed: bool,
    ) -> Result<()> {
        let mut pos = 0usize;
        for comp in 0..self.buffers.len() {
            let n = self.tile.comps[comp].rect.area() as usize;
            let need = n * bytes_per_sample;
            if pos + need > src.len() {
                return Err(CodecError::OutOfBounds(
                    "packed tile data shorter than the tile".into(),
                ));
            }
            let buf = &mut self.buffers[comp];
            for i in 0..n {
                let at = pos + i * bytes_per_sample;
                let v = unpack_sample(&src[at..at + bytes_per_sample], signed);
                if self.irreversible {
                    buf.fdata[i] = v as f32;
                } else {
                    buf.idata[i] = v;
                }
            }
            pos += need;
        }
        Ok(())
    }

    /// Store decoded tile samples as packed bytes, planar, little-endian.
    pub fn update_tile_data_packed(
        &self,
        dst: &mut Vec<u8>,
        bytes_per_sample: usize,
        signed: bool,
    ) -> Result<()> {
        for buf in &self.buffers {
            for &v in &buf.idata {
                pack_sample(v, bytes_per_sample, signed, dst)?;
            }
        }
        Ok(())
    }
}

fn unpack_sample(bytes: &[u8], signed: bool) -> i32 {
    match (bytes.len(), signed) {
        (1, false) => bytes[0] as i32,
        (1, true) => bytes[0] as i8 as i32,
        (2, false) => u16::from_le_bytes([bytes[0], bytes[1]]) as i32,
        (2, true) => i16::from_le_bytes([bytes[0], bytes[1]]) as i32,
        (4, _) => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        _ => 0,
    }
}

fn pack_sample(v: i32, bytes_per_sample: usize, signed: bool, dst: &mut Vec<u8>) -> Result<()> {
    match (bytes_per_sample, signed) {
        (1, false) => dst.push(v.clamp(0, 255) as u8),
        (1, true) => dst.push(v.clamp(-128, 127) as i8 as u8),
        (2, false) => dst.extend_from_slice(&(v.clamp(0, 65535) as u16).to_le_bytes()),
        (2, true) => dst.extend_from_slice(&(v.clamp(-32768, 32767) as i16).to_le_bytes()),
        (4, _) => dst.extend_from_slice(&v.to_le_bytes()),
        _ => {
            return Err(CodecError::InconsistentParams(format!(
                "unsupported sample width {bytes_per_sample}"
            )))
        }
    }
    Ok(())
}

fn same_dims(bufs: &[TileBuffer]) -> bool {
    bufs.windows(2)
        .all(|w| w[0].width == w[1].width && w[0].height == w[1].height)
}

fn rate_control_needed(tcp: &TileCodingParams) -> bool {
    tcp.rates.iter().any(|&r| r > 0.0) || tcp.distoratio.iter().any(|&d| d > 0.0)
}

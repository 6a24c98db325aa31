//! The codec surface consumed by the surrounding application: parameters
//! and raster in, raw packet byte runs out (and back). Code-stream marker
//! framing stays with the caller; what crosses this boundary is exactly
//! what sits between SOD markers, plus optional packet-length records.

use std::collections::HashMap;

use log::warn;

use crate::coding_params::{CodingParams, TileCacheStrategy};
use crate::error::{CodecError, Result};
use crate::image::Image;
use crate::math::Rect;
use crate::tile::tile_grid;
use crate::tile_processor::{CompressedTile, TileProcessor};

/// Drives tile encoding over a borrowed input image.
pub struct Compressor<'a> {
    params: CodingParams,
    image: &'a Image,
    started: bool,
    pool: Option<rayon::ThreadPool>,
}

impl<'a> Compressor<'a> {
    pub fn new(params: CodingParams, image: &'a Image) -> Result<Self> {
        image.validate()?;
        params.validate(image.components.len())?;
        let pool = build_pool(params.num_threads)?;
        Ok(Self {
            params,
            image,
            started: false,
            pool,
        })
    }

    /// Number of tiles in the grid.
    pub fn num_tiles(&self) -> u32 {
        let (tw, th) = tile_grid(self.image, &self.params);
        tw * th
    }

    /// Final parameter cross-checks before the first tile. The caller
    /// emits its code-stream preamble around this point.
    pub fn start(&mut self) -> Result<()> {
        for compno in 0..self.image.components.len() {
            let shift = self.params.roi_shift_for(compno);
            if shift > 16 {
                return Err(CodecError::InconsistentParams(format!(
                    "region-of-interest shift {shift} too large"
                )));
            }
        }
        self.started = true;
        Ok(())
    }

    /// Encode every tile in index order.
    pub fn compress(&mut self) -> Result<Vec<CompressedTile>> {
        (0..self.num_tiles())
            .map(|tileno| self.compress_tile(tileno))
            .collect()
    }

    /// Encode one tile; usable in any order (push mode).
    pub fn compress_tile(&mut self, tileno: u32) -> Result<CompressedTile> {
        if !self.started {
            self.start()?;
        }
        let image = self.image;
        let params = &self.params;
        let run = || -> Result<CompressedTile> {
            let mut proc = TileProcessor::new_encode(image, params, tileno)?;
            proc.encode_tile(image, params, usize::MAX)
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }

    /// Encode one tile from packed raw samples instead of the bound image
    /// (the tile-by-tile push surface).
    pub fn compress_tile_from(
        &mut self,
        tileno: u32,
        data: &[u8],
        bytes_per_sample: usize,
        signed: bool,
    ) -> Result<CompressedTile> {
        if !self.started {
            self.start()?;
        }
        let image = self.image;
        let params = &self.params;
        let run = || -> Result<CompressedTile> {
            let mut proc = TileProcessor::new_encode(image, params, tileno)?;
            proc.copy_tile_data_packed(data, bytes_per_sample, signed)?;
            proc.encode_tile_prefilled(image, params, usize::MAX)
        };
        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}

/// Drives tile decoding into an owned output image.
pub struct Decompressor {
    params: CodingParams,
    image: Image,
    window: Option<Rect>,
    cache: HashMap<u32, TileProcessor>,
    tile_ok: HashMap<u32, bool>,
    pool: Option<rayon::ThreadPool>,
}

impl Decompressor {
    /// `template` describes the geometry being decoded (what a parsed main
    /// header says); its sample buffers receive the output.
    pub fn new(params: CodingParams, template: Image) -> Result<Self> {
        template.validate()?;
        params.validate(template.components.len())?;
        let pool = build_pool(params.num_threads)?;
        Ok(Self {
            params,
            image: template,
            window: None,
            cache: HashMap::new(),
            tile_ok: HashMap::new(),
            pool,
        })
    }

    pub fn num_tiles(&self) -> u32 {
        let (tw, th) = tile_grid(&self.image, &self.params);
        tw * th
    }

    /// Restrict decoding to a canvas-space window. Must precede the tile
    /// decodes it should affect.
    pub fn set_window(&mut self, window: Rect) -> Result<()> {
        if window.is_empty()
            || window.x1 > self.image.x1
            || window.y1 > self.image.y1
        {
            return Err(CodecError::OutOfBounds(format!(
                "window ({},{})-({},{}) outside the image",
                window.x0, window.y0, window.x1, window.y1
            )));
        }
        self.window = Some(window);
        Ok(())
    }

    /// Decode one tile's packet bytes (random tile access).
    pub fn decompress_tile(&mut self, tileno: u32, bytes: &[u8]) -> Result<()> {
        let mut proc = TileProcessor::new_decode(&self.image, &self.params, tileno)?;
        if let Some(window) = self.window {
            proc.set_window(window);
        }
        let image = &mut self.image;
        let result = match &self.pool {
            Some(pool) => pool.install(|| proc.decode_tile(image, bytes)),
            None => proc.decode_tile(image, bytes),
        };
        self.tile_ok.insert(tileno, result.is_ok() && proc.valid);
        match self.params.tile_cache_strategy {
            TileCacheStrategy::None => {}
            TileCacheStrategy::Tile => {
                self.cache.clear();
                self.cache.insert(tileno, proc);
            }
            TileCacheStrategy::All => {
                self.cache.insert(tileno, proc);
            }
        }
        result
    }

    /// Decode a batch of (tile index, bytes) pairs.
    pub fn decompress(&mut self, tiles: &[(u32, &[u8])]) -> Result<()> {
        for &(tileno, bytes) in tiles {
            self.decompress_tile(tileno, bytes)?;
        }
        Ok(())
    }

    /// Whether a decoded tile came out whole.
    pub fn tile_valid(&self, tileno: u32) -> bool {
        self.tile_ok.get(&tileno).copied().unwrap_or(false)
    }

    pub fn cached_tile(&self, tileno: u32) -> Option<&TileProcessor> {
        self.cache.get(&tileno)
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Cross-tile finalization after the last tile decode: drops the
    /// decode window and any tile cache no longer wanted, reports tiles
    /// that came out partial, and hands back a view of the output raster.
    pub fn post_process(&mut self) -> Result<&Image> {
        if self.tile_ok.is_empty() {
            return Err(CodecError::InconsistentParams(
                "no tiles have been decoded".into(),
            ));
        }
        let mut partial: Vec<u32> = self
            .tile_ok
            .iter()
            .filter(|&(_, &ok)| !ok)
            .map(|(&tileno, _)| tileno)
            .collect();
        if !partial.is_empty() {
            partial.sort_unstable();
            warn!("tiles decoded partially: {partial:?}");
        }
        self.window = None;
        if self.params.tile_cache_strategy == TileCacheStrategy::None {
            self.cache.clear();
        }
        Ok(&self.image)
    }

    /// Finish and hand the output raster out.
    pub fn into_image(self) -> Image {
        self.image
    }
}

fn build_pool(num_threads: usize) -> Result<Option<rayon::ThreadPool>> {
    if num_threads == 0 {
        return Ok(None);
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map(Some)
        .map_err(|e| CodecError::AllocationFailure(format!("thread pool: {e}")))
}

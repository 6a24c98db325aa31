//! Raster model shared by both directions of the codec.
//!
//! Components carry their own subsampling and precision; sample storage is
//! always `i32` regardless of declared precision, matching the width the
//! wavelet stages work in.

use crate::error::{CodecError, Result};
use crate::math::ceil_div;

#[derive(Debug, Clone)]
pub struct ImageComponent {
    /// Horizontal/vertical subsampling with respect to the canvas grid.
    pub dx: u32,
    pub dy: u32,
    /// Size in component samples.
    pub width: u32,
    pub height: u32,
    /// Declared sample precision in bits (1..=16 supported by the core).
    pub precision: u32,
    pub signed: bool,
    /// Row-major samples, `width * height` entries.
    pub data: Vec<i32>,
}

impl ImageComponent {
    pub fn new(width: u32, height: u32, precision: u32, signed: bool) -> Self {
        Self {
            dx: 1,
            dy: 1,
            width,
            height,
            precision,
            signed,
            data: vec![0; (width as usize) * (height as usize)],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Image {
    /// Image area on the reference canvas.
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    pub components: Vec<ImageComponent>,
}

impl Image {
    /// Build an image whose area starts at the canvas origin, with all
    /// components fully sampled.
    pub fn new(width: u32, height: u32, components: Vec<ImageComponent>) -> Self {
        Self {
            x0: 0,
            y0: 0,
            x1: width,
            y1: height,
            components,
        }
    }

    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn validate(&self) -> Result<()> {
        if self.x1 <= self.x0 || self.y1 <= self.y0 {
            return Err(CodecError::InconsistentParams(
                "empty image area".into(),
            ));
        }
        if self.components.is_empty() {
            return Err(CodecError::InconsistentParams(
                "image has no components".into(),
            ));
        }
        for (i, comp) in self.components.iter().enumerate() {
            if comp.dx == 0 || comp.dy == 0 {
                return Err(CodecError::InconsistentParams(format!(
                    "component {i} has zero subsampling"
                )));
            }
            if comp.precision == 0 || comp.precision > 16 {
                return Err(CodecError::InconsistentParams(format!(
                    "component {i} precision {} outside 1..=16",
                    comp.precision
                )));
            }
            let expect_w = ceil_div(self.x1, comp.dx) - self.x0.div_ceil(comp.dx);
            let expect_h = ceil_div(self.y1, comp.dy) - self.y0.div_ceil(comp.dy);
            if comp.width < expect_w || comp.height < expect_h {
                return Err(CodecError::InconsistentParams(format!(
                    "component {i} is {}x{}, image area needs {}x{}",
                    comp.width, comp.height, expect_w, expect_h
                )));
            }
            if comp.data.len() < (comp.width as usize) * (comp.height as usize) {
                return Err(CodecError::AllocationFailure(format!(
                    "component {i} sample buffer shorter than its declared size"
                )));
            }
        }
        Ok(())
    }
}

//! Coding parameters: the validated, already-parsed form of the COD/QCD/POC
//! marker content that the tile pipeline consumes.
//!
//! Marker parsing itself lives outside this crate; callers hand in a
//! [`CodingParams`] and the codec derives one [`TileCodingParams`] per tile.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{CodecError, Result};

/// Code-block style bit: MQ bypass (lazy) coding of passes 1 and 2 in the
/// low bit planes.
pub const CBLK_STY_LAZY: u8 = 0x01;
/// Code-block style bit: reset context states between coding passes.
pub const CBLK_STY_RESET: u8 = 0x02;
/// Code-block style bit: terminate the arithmetic coder after every pass.
pub const CBLK_STY_TERMALL: u8 = 0x04;
/// Code-block style bit: vertically stripe-causal context formation.
pub const CBLK_STY_VSC: u8 = 0x08;
/// Code-block style bit: predictable (easy) termination.
pub const CBLK_STY_PTERM: u8 = 0x10;
/// Code-block style bit: segmentation symbol at the end of each cleanup pass.
pub const CBLK_STY_SEGSYM: u8 = 0x20;

pub const MAX_RESOLUTIONS: u32 = 33;
pub const MAX_PRECISION: u32 = 16;
/// Most coding passes a code block can carry (37 planes * 3 - 2).
pub const MAX_PASSES: usize = 109;

/// Progression order of the packet stream (A.6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ProgressionOrder {
    #[default]
    Lrcp = 0,
    Rlcp = 1,
    Rpcl = 2,
    Pcrl = 3,
    Cprl = 4,
}

/// Which layer-formation algorithm drives rate control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RateControlAlgorithm {
    Simple = 0,
    /// Bisection over convex-hull slope indices. The default: layers land
    /// exactly on the rate-distortion frontier.
    #[default]
    Feasible = 1,
}

/// How decoded tiles are retained by the decompressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TileCacheStrategy {
    #[default]
    None = 0,
    Tile = 1,
    All = 2,
}

/// Multi-component transform selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MctMode {
    #[default]
    None = 0,
    /// RCT for reversible tiles, ICT for irreversible ones.
    Standard = 1,
    /// Arbitrary square matrix over all components.
    Custom = 2,
}

/// A progression-order-change record: overrides axis ranges for one span of
/// the packet sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PocRecord {
    pub res_start: u32,
    pub comp_start: u32,
    pub layer_end: u32,
    pub res_end: u32,
    pub comp_end: u32,
    pub order: ProgressionOrder,
}

/// Everything the codec needs to know, image-wide.
#[derive(Debug, Clone)]
pub struct CodingParams {
    /// Tile grid origin on the canvas.
    pub tile_x0: u32,
    pub tile_y0: u32,
    /// Nominal tile size. Zero means one tile covering the image.
    pub tile_width: u32,
    pub tile_height: u32,

    pub num_layers: u32,
    /// Per-layer rate target in bits per pixel; 0 disables the cap for that
    /// layer.
    pub rates: Vec<f64>,
    /// Per-layer fixed-quality target in dB PSNR; 0 disables.
    pub distoratio: Vec<f64>,

    pub num_resolutions: u32,
    /// log2 of the nominal code-block width, in 2..=6.
    pub cblk_w_exp: u32,
    /// log2 of the nominal code-block height, in 2..=6.
    pub cblk_h_exp: u32,
    pub cblk_sty: u8,
    /// Per-resolution precinct exponents, most-significant resolution first.
    /// Empty means maximal precincts (2^15).
    pub precinct_sizes: Vec<(u32, u32)>,

    pub progression: ProgressionOrder,
    pub pocs: Vec<PocRecord>,

    pub irreversible: bool,
    pub mct: MctMode,
    /// Row-major square matrix for `MctMode::Custom`.
    pub custom_mct_matrix: Vec<f32>,

    /// Region-of-interest up-shift applied per component (maxshift over the
    /// whole component). Empty means no ROI anywhere.
    pub roi_shift: Vec<u32>,

    pub num_guard_bits: u32,
    pub num_threads: usize,
    pub tile_cache_strategy: TileCacheStrategy,
    /// Collect per-packet lengths for PLT emission.
    pub write_plt: bool,
    pub rate_control: RateControlAlgorithm,
    /// Emit SOP marker segments before each packet.
    pub use_sop: bool,
    /// Emit an EPH marker after each packet header.
    pub use_eph: bool,
}

impl Default for CodingParams {
    fn default() -> Self {
        Self {
            tile_x0: 0,
            tile_y0: 0,
            tile_width: 0,
            tile_height: 0,
            num_layers: 1,
            rates: Vec::new(),
            distoratio: Vec::new(),
            num_resolutions: 6,
            cblk_w_exp: 6,
            cblk_h_exp: 6,
            cblk_sty: 0,
            precinct_sizes: Vec::new(),
            progression: ProgressionOrder::Lrcp,
            pocs: Vec::new(),
            irreversible: false,
            mct: MctMode::None,
            custom_mct_matrix: Vec::new(),
            roi_shift: Vec::new(),
            num_guard_bits: 2,
            num_threads: 0,
            tile_cache_strategy: TileCacheStrategy::None,
            write_plt: false,
            rate_control: RateControlAlgorithm::Feasible,
            use_sop: false,
            use_eph: false,
        }
    }
}

impl CodingParams {
    pub fn validate(&self, num_components: usize) -> Result<()> {
        if self.num_resolutions == 0 || self.num_resolutions > MAX_RESOLUTIONS {
            return Err(CodecError::InconsistentParams(format!(
                "resolution count {} outside 1..={}",
                self.num_resolutions, MAX_RESOLUTIONS
            )));
        }
        if !(2..=6).contains(&self.cblk_w_exp) || !(2..=6).contains(&self.cblk_h_exp) {
            return Err(CodecError::InconsistentParams(format!(
                "code-block exponents ({}, {}) outside 2..=6",
                self.cblk_w_exp, self.cblk_h_exp
            )));
        }
        if self.cblk_w_exp + self.cblk_h_exp > 12 {
            return Err(CodecError::InconsistentParams(
                "code-block area exceeds 4096 samples".into(),
            ));
        }
        if self.num_layers == 0 || self.num_layers > 100 {
            return Err(CodecError::InconsistentParams(format!(
                "layer count {} outside 1..=100",
                self.num_layers
            )));
        }
        if !(1..=7).contains(&self.num_guard_bits) {
            return Err(CodecError::InconsistentParams(format!(
                "guard bit count {} outside 1..=7",
                self.num_guard_bits
            )));
        }
        if self.mct == MctMode::Standard && num_components < 3 {
            return Err(CodecError::InconsistentParams(
                "standard component transform needs at least 3 components".into(),
            ));
        }
        if self.mct == MctMode::Custom
            && self.custom_mct_matrix.len() != num_components * num_components
        {
            return Err(CodecError::InconsistentParams(format!(
                "custom transform matrix has {} entries, expected {}",
                self.custom_mct_matrix.len(),
                num_components * num_components
            )));
        }
        for poc in &self.pocs {
            if poc.res_start >= poc.res_end || poc.comp_start >= poc.comp_end {
                return Err(CodecError::InconsistentParams(
                    "empty progression-order-change range".into(),
                ));
            }
        }
        for (i, &(pw, ph)) in self.precinct_sizes.iter().enumerate() {
            if pw > 15 || ph > 15 {
                return Err(CodecError::InconsistentParams(
                    "precinct exponent above 15".into(),
                ));
            }
            // Any entry that can serve a resolution above 0 must leave room
            // for the half-scale code-block grid.
            let serves_higher = self.num_resolutions > 1
                && (i > 0 || self.precinct_sizes.len() == 1);
            if serves_higher && (pw == 0 || ph == 0) {
                return Err(CodecError::InconsistentParams(
                    "precinct exponent 0 is only legal at resolution 0".into(),
                ));
            }
        }
        Ok(())
    }

    /// Precinct exponents for one resolution level (counted from the lowest
    /// resolution upward, as the lattice stores them).
    pub fn precinct_exponents(&self, resno: u32) -> (u32, u32) {
        if self.precinct_sizes.is_empty() {
            return (15, 15);
        }
        let idx = (resno as usize).min(self.precinct_sizes.len() - 1);
        self.precinct_sizes[idx]
    }

    pub fn roi_shift_for(&self, compno: usize) -> u32 {
        self.roi_shift.get(compno).copied().unwrap_or(0)
    }

    /// Per-layer rate target for `layno`, or 0 when uncapped.
    pub fn rate_for(&self, layno: usize) -> f64 {
        self.rates.get(layno).copied().unwrap_or(0.0)
    }

    pub fn distoratio_for(&self, layno: usize) -> f64 {
        self.distoratio.get(layno).copied().unwrap_or(0.0)
    }
}

/// Per-component slice of the tile coding parameters.
#[derive(Debug, Clone)]
pub struct TileComponentParams {
    pub num_resolutions: u32,
    pub cblk_w_exp: u32,
    pub cblk_h_exp: u32,
    pub cblk_sty: u8,
    /// 1 = reversible 5/3, 0 = irreversible 9/7 (the QMFB identifier of the
    /// code stream).
    pub qmfbid: u32,
    pub num_guard_bits: u32,
    pub roi_shift: u32,
    /// (mant, expn) pairs, one per sub-band in LL, (HL, LH, HH)* order.
    pub step_sizes: Vec<(u32, u32)>,
    /// Per-resolution precinct exponents.
    pub precincts: Vec<(u32, u32)>,
}

/// Coding parameters bound to one tile: what a parsed SOT/COD/QCD sequence
/// boils down to.
#[derive(Debug, Clone)]
pub struct TileCodingParams {
    pub progression: ProgressionOrder,
    pub pocs: Vec<PocRecord>,
    pub num_layers: u32,
    pub mct: MctMode,
    pub custom_mct_matrix: Vec<f32>,
    pub rates: Vec<f64>,
    pub distoratio: Vec<f64>,
    pub use_sop: bool,
    pub use_eph: bool,
    pub rate_control: RateControlAlgorithm,
    pub components: Vec<TileComponentParams>,
}

impl TileCodingParams {
    /// Derive the tile parameters from image-wide settings. Step sizes are
    /// filled by the quantizer once component precision is known.
    pub fn from_params(params: &CodingParams, num_components: usize) -> Self {
        let components = (0..num_components)
            .map(|compno| {
                let precincts = (0..params.num_resolutions)
                    .map(|r| params.precinct_exponents(r))
                    .collect();
                TileComponentParams {
                    num_resolutions: params.num_resolutions,
                    cblk_w_exp: params.cblk_w_exp,
                    cblk_h_exp: params.cblk_h_exp,
                    cblk_sty: params.cblk_sty,
                    qmfbid: if params.irreversible { 0 } else { 1 },
                    num_guard_bits: params.num_guard_bits,
                    roi_shift: params.roi_shift_for(compno),
                    step_sizes: Vec::new(),
                    precincts,
                }
            })
            .collect();
        Self {
            progression: params.progression,
            pocs: params.pocs.clone(),
            num_layers: params.num_layers,
            mct: params.mct,
            custom_mct_matrix: params.custom_mct_matrix.clone(),
            rates: params.rates.clone(),
            distoratio: params.distoratio.clone(),
            use_sop: params.use_sop,
            use_eph: params.use_eph,
            rate_control: params.rate_control,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let params = CodingParams::default();
        assert!(params.validate(1).is_ok());
        assert_eq!(params.precinct_exponents(0), (15, 15));
        assert_eq!(params.rate_for(3), 0.0);
    }

    #[test]
    fn test_rejects_bad_blocks() {
        let params = CodingParams {
            cblk_w_exp: 7,
            ..Default::default()
        };
        assert!(params.validate(1).is_err());

        let params = CodingParams {
            cblk_w_exp: 6,
            cblk_h_exp: 6,
            num_resolutions: 0,
            ..Default::default()
        };
        assert!(params.validate(1).is_err());
    }

    #[test]
    fn test_mct_needs_three_components() {
        let params = CodingParams {
            mct: MctMode::Standard,
            ..Default::default()
        };
        assert!(params.validate(2).is_err());
        assert!(params.validate(3).is_ok());
    }

    #[test]
    fn test_progression_order_from_u8() {
        assert_eq!(
            ProgressionOrder::try_from(2u8).unwrap(),
            ProgressionOrder::Rpcl
        );
        assert!(ProgressionOrder::try_from(5u8).is_err());
    }
}

/*!
# j2kexp-rs

`j2kexp-rs` is a pure Rust implementation of the JPEG 2000 (ISO/IEC
15444-1) tile codec: the pipeline between a parsed set of coding
parameters and the raw packet byte runs of a code stream.

## Pipeline

- **Color transform**: reversible RCT and irreversible ICT (BT.601
  constants), plus arbitrary-matrix transforms (`mct`).
- **Wavelets**: 5/3 integer and 9/7 float lifting with symmetric
  extension, full-tile both directions and windowed inverse (`dwt`).
- **Tier-1**: three-pass context modelling over bit planes, MQ and raw
  coding, all Part-1 mode switches (`t1`, `mq_coder`).
- **Tier-2**: packet headers with tag trees, segment lengths, SOP/EPH,
  packet-length records (`t2`, `tag_tree`, `bit_io`,
  `packet_iterator`).
- **Rate control**: convex-hull and simple PCRD bisection (`rate_control`).
- **Tile plumbing**: lattice geometry, window buffers, the per-tile
  driver, and the public `Compressor`/`Decompressor` surface (`tile`,
  `buffer`, `tile_processor`, `codec`).

Code-stream marker parsing and serialization (SIZ, COD, SOT, JP2 boxes)
are deliberately out of scope: callers hand in a [`CodingParams`] and move
packet bytes in and out.

## Safety

Written in safe Rust throughout; concurrency comes from `rayon` with
disjoint data per task.
*/

pub mod bit_io;
pub mod buffer;
pub mod codec;
pub mod coding_params;
pub mod dwt;
pub mod error;
pub mod image;
pub mod math;
pub mod mct;
pub mod mq_coder;
pub mod packet_iterator;
pub mod quantization;
pub mod rate_control;
pub mod t1;
pub mod t2;
pub mod tag_tree;
pub mod tile;
pub mod tile_processor;

pub use codec::{Compressor, Decompressor};
pub use coding_params::{
    CodingParams, MctMode, PocRecord, ProgressionOrder, RateControlAlgorithm, TileCacheStrategy,
    CBLK_STY_LAZY, CBLK_STY_PTERM, CBLK_STY_RESET, CBLK_STY_SEGSYM, CBLK_STY_TERMALL, CBLK_STY_VSC,
};
pub use error::{CodecError, Result};
pub use image::{Image, ImageComponent};
pub use math::Rect;
pub use tile_processor::{CompressedTile, TileProcessor};

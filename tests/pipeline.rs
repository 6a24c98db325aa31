//! End-to-end pipeline scenarios: full encode/decode through the public
//! codec surface.

use j2kexp_rs::coding_params::MctMode;
use j2kexp_rs::{
    CodingParams, Compressor, Decompressor, Image, ImageComponent, Rect, CBLK_STY_TERMALL,
    CBLK_STY_VSC,
};

fn xorshift(state: &mut u32) -> u32 {
    *state ^= *state << 13;
    *state ^= *state >> 17;
    *state ^= *state << 5;
    *state
}

fn random_component(w: u32, h: u32, precision: u32, seed: u32) -> ImageComponent {
    let mut comp = ImageComponent::new(w, h, precision, false);
    let mut state = seed;
    let mask = (1u32 << precision) - 1;
    for v in &mut comp.data {
        *v = (xorshift(&mut state) & mask) as i32;
    }
    comp
}

fn encode_image(image: &Image, params: &CodingParams) -> Vec<u8> {
    let mut compressor = Compressor::new(params.clone(), image).unwrap();
    let tiles = compressor.compress().unwrap();
    assert_eq!(tiles.len(), 1);
    tiles.into_iter().next().unwrap().bytes
}

fn decode_image(template: Image, params: &CodingParams, bytes: &[u8]) -> Image {
    let mut dec = Decompressor::new(params.clone(), template).unwrap();
    dec.decompress_tile(0, bytes).unwrap();
    assert!(dec.tile_valid(0));
    dec.post_process().unwrap();
    dec.into_image()
}

fn template_like(image: &Image) -> Image {
    let comps = image
        .components
        .iter()
        .map(|c| {
            let mut t = ImageComponent::new(c.width, c.height, c.precision, c.signed);
            t.dx = c.dx;
            t.dy = c.dy;
            t
        })
        .collect();
    Image {
        x0: image.x0,
        y0: image.y0,
        x1: image.x1,
        y1: image.y1,
        components: comps,
    }
}

/// S1: 64x64 unsigned 8-bit single-channel random image, reversible,
/// 1 layer, 3 resolutions, 32x32 code blocks.
#[test]
fn s1_lossless_gray_roundtrip() {
    let image = Image::new(64, 64, vec![random_component(64, 64, 8, 0xC0FFEE)]);
    let params = CodingParams {
        num_resolutions: 3,
        cblk_w_exp: 5,
        cblk_h_exp: 5,
        ..Default::default()
    };
    let bytes = encode_image(&image, &params);
    let decoded = decode_image(template_like(&image), &params, &bytes);
    assert_eq!(image.components[0].data, decoded.components[0].data);
}

/// S3: 256x256 16-bit grayscale ramp, reversible, 4 resolutions,
/// VSC + TERMALL, exact recovery.
#[test]
fn s3_ramp_16bit_vsc_termall() {
    let mut comp = ImageComponent::new(256, 256, 16, false);
    for y in 0..256usize {
        for x in 0..256usize {
            comp.data[y * 256 + x] = (x + y) as i32;
        }
    }
    let image = Image::new(256, 256, vec![comp]);
    let params = CodingParams {
        num_resolutions: 4,
        cblk_sty: CBLK_STY_VSC | CBLK_STY_TERMALL,
        ..Default::default()
    };
    let bytes = encode_image(&image, &params);
    let decoded = decode_image(template_like(&image), &params, &bytes);
    assert_eq!(image.components[0].data, decoded.components[0].data);
}

/// Lossless RGB with the reversible component transform.
#[test]
fn lossless_rgb_rct_roundtrip() {
    let image = Image::new(
        96,
        80,
        vec![
            random_component(96, 80, 8, 1),
            random_component(96, 80, 8, 2),
            random_component(96, 80, 8, 3),
        ],
    );
    let params = CodingParams {
        num_resolutions: 4,
        mct: MctMode::Standard,
        ..Default::default()
    };
    let bytes = encode_image(&image, &params);
    let decoded = decode_image(template_like(&image), &params, &bytes);
    for c in 0..3 {
        assert_eq!(
            image.components[c].data, decoded.components[c].data,
            "component {c}"
        );
    }
}

/// Lossless roundtrip across block styles and odd geometry.
#[test]
fn lossless_mode_switch_sweep() {
    use j2kexp_rs::{CBLK_STY_LAZY, CBLK_STY_PTERM, CBLK_STY_RESET, CBLK_STY_SEGSYM};
    let image = Image::new(70, 50, vec![random_component(70, 50, 10, 99)]);
    for sty in [
        0,
        CBLK_STY_LAZY,
        CBLK_STY_RESET,
        CBLK_STY_SEGSYM,
        CBLK_STY_PTERM,
        CBLK_STY_LAZY | CBLK_STY_VSC,
        CBLK_STY_TERMALL | CBLK_STY_SEGSYM,
    ] {
        let params = CodingParams {
            num_resolutions: 5,
            cblk_w_exp: 4,
            cblk_h_exp: 4,
            cblk_sty: sty,
            ..Default::default()
        };
        let bytes = encode_image(&image, &params);
        let decoded = decode_image(template_like(&image), &params, &bytes);
        assert_eq!(
            image.components[0].data, decoded.components[0].data,
            "style {sty:#04x}"
        );
    }
}

/// Lossless roundtrip under each progression order.
#[test]
fn lossless_all_progressions() {
    use j2kexp_rs::ProgressionOrder;
    let image = Image::new(64, 64, vec![
        random_component(64, 64, 8, 7),
        random_component(64, 64, 8, 8),
        random_component(64, 64, 8, 9),
    ]);
    for order in [
        ProgressionOrder::Lrcp,
        ProgressionOrder::Rlcp,
        ProgressionOrder::Rpcl,
        ProgressionOrder::Pcrl,
        ProgressionOrder::Cprl,
    ] {
        let params = CodingParams {
            num_resolutions: 3,
            progression: order,
            precinct_sizes: vec![(6, 6)],
            use_sop: true,
            use_eph: true,
            ..Default::default()
        };
        let bytes = encode_image(&image, &params);
        let decoded = decode_image(template_like(&image), &params, &bytes);
        for c in 0..3 {
            assert_eq!(
                image.components[c].data, decoded.components[c].data,
                "{order:?} component {c}"
            );
        }
    }
}

/// Multiple tiles decode independently and reassemble the image.
#[test]
fn tiled_lossless_roundtrip() {
    let image = Image::new(100, 90, vec![random_component(100, 90, 8, 11)]);
    let params = CodingParams {
        num_resolutions: 3,
        tile_width: 48,
        tile_height: 40,
        ..Default::default()
    };
    let mut compressor = Compressor::new(params.clone(), &image).unwrap();
    assert_eq!(compressor.num_tiles(), 9);
    let tiles = compressor.compress().unwrap();

    let mut dec = Decompressor::new(params.clone(), template_like(&image)).unwrap();
    // Decode out of order: the tiles are independent.
    for tileno in (0..9u32).rev() {
        dec.decompress_tile(tileno, &tiles[tileno as usize].bytes)
            .unwrap();
    }
    dec.post_process().unwrap();
    let decoded = dec.into_image();
    assert_eq!(image.components[0].data, decoded.components[0].data);
}

/// S2: solid red RGB, irreversible 9/7, 6 resolutions, 3 layers at
/// (0.5, 1.0, 2.0) bpp; every channel decodes within 1.
#[test]
fn s2_irreversible_solid_red_layers() {
    let w = 1024u32;
    let h = 1024u32;
    let mut r = ImageComponent::new(w, h, 8, false);
    r.data.iter_mut().for_each(|v| *v = 255);
    let g = ImageComponent::new(w, h, 8, false);
    let b = ImageComponent::new(w, h, 8, false);
    let image = Image::new(w, h, vec![r, g, b]);
    let params = CodingParams {
        num_resolutions: 6,
        num_layers: 3,
        rates: vec![0.5, 1.0, 2.0],
        irreversible: true,
        mct: MctMode::Standard,
        ..Default::default()
    };
    let bytes = encode_image(&image, &params);
    let decoded = decode_image(template_like(&image), &params, &bytes);
    for (c, want) in [(0usize, 255i32), (1, 0), (2, 0)] {
        for &v in &decoded.components[c].data {
            assert!(
                (v - want).abs() <= 1,
                "component {c}: got {v}, expected {want}"
            );
        }
    }
}

fn psnr(a: &[i32], b: &[i32], peak: f64) -> f64 {
    let mut sse = 0f64;
    for (&x, &y) in a.iter().zip(b) {
        let e = (x - y) as f64;
        sse += e * e;
    }
    let mse = sse / a.len() as f64;
    if mse == 0.0 {
        return f64::INFINITY;
    }
    10.0 * (peak * peak / mse).log10()
}

fn smooth_component(w: u32, h: u32, seed: u32) -> ImageComponent {
    let mut comp = ImageComponent::new(w, h, 8, false);
    let mut state = seed;
    for y in 0..h as usize {
        for x in 0..w as usize {
            let base = ((x * 255) / w as usize + (y * 255) / h as usize) / 2;
            let noise = (xorshift(&mut state) % 5) as usize;
            comp.data[y * w as usize + x] = (base + noise).min(255) as i32;
        }
    }
    comp
}

/// S4: fixed-quality targets in dB; PSNR after each layer reaches the
/// target within half a dB. Layer prefixes are recovered through the
/// packet-length records.
#[test]
fn s4_fixed_quality_layers() {
    let w = 512u32;
    let h = 512u32;
    let image = Image::new(
        w,
        h,
        vec![
            smooth_component(w, h, 100),
            smooth_component(w, h, 200),
            smooth_component(w, h, 300),
        ],
    );
    let targets = [20.0f64, 30.0, 40.0];
    let params = CodingParams {
        num_resolutions: 5,
        num_layers: 3,
        distoratio: targets.to_vec(),
        irreversible: true,
        mct: MctMode::Standard,
        write_plt: true,
        ..Default::default()
    };
    let mut compressor = Compressor::new(params.clone(), &image).unwrap();
    let tile = compressor.compress().unwrap().into_iter().next().unwrap();

    // LRCP: packets of layers 0..=l form a byte prefix.
    let packets_per_layer = tile.packet_lengths.len() / 3;
    for (layno, &target) in targets.iter().enumerate() {
        let upto = tile.packet_lengths[..packets_per_layer * (layno + 1)]
            .iter()
            .map(|&n| n as usize)
            .sum::<usize>();
        let layer_params = CodingParams {
            num_layers: layno as u32 + 1,
            ..params.clone()
        };
        let decoded = decode_image(template_like(&image), &layer_params, &tile.bytes[..upto]);
        // Aggregate PSNR over all three components.
        let mut all_src = Vec::new();
        let mut all_dec = Vec::new();
        for c in 0..3 {
            all_src.extend_from_slice(&image.components[c].data);
            all_dec.extend_from_slice(&decoded.components[c].data);
        }
        let quality = psnr(&all_src, &all_dec, 255.0);
        assert!(
            quality >= target - 0.5,
            "layer {layno}: {quality:.2} dB < {target} dB"
        );
    }
}

/// S5: windowed decode equals the matching window of a full decode.
#[test]
fn s5_windowed_decode_equivalence() {
    let w = 2048u32;
    let h = 2048u32;
    let mut comp = ImageComponent::new(w, h, 8, false);
    let mut state = 5u32;
    for y in 0..h as usize {
        for x in 0..w as usize {
            let base = ((x >> 3) ^ (y >> 3)) & 0xF0;
            let noise = (xorshift(&mut state) & 3) as usize;
            comp.data[y * w as usize + x] = (base as usize + noise) as i32;
        }
    }
    let image = Image::new(w, h, vec![comp]);
    let params = CodingParams {
        num_resolutions: 8,
        ..Default::default()
    };
    let bytes = encode_image(&image, &params);

    let full = decode_image(template_like(&image), &params, &bytes);

    let window = Rect::new(512, 512, 1024, 1024);
    let mut dec = Decompressor::new(params.clone(), template_like(&image)).unwrap();
    dec.set_window(window).unwrap();
    dec.decompress_tile(0, &bytes).unwrap();
    let windowed = dec.into_image();

    for y in window.y0..window.y1 {
        for x in window.x0..window.x1 {
            let idx = (y * w + x) as usize;
            assert_eq!(
                windowed.components[0].data[idx], full.components[0].data[idx],
                "mismatch at ({x},{y})"
            );
        }
    }
}

/// S6: random access to a single code block's footprint: window on the
/// spatial rectangle of the third HL code block at resolution 2.
#[test]
fn s6_single_block_window() {
    let w = 512u32;
    let h = 512u32;
    let image = Image::new(w, h, vec![random_component(w, h, 8, 0xAB)]);
    let params = CodingParams {
        num_resolutions: 6,
        cblk_w_exp: 4,
        cblk_h_exp: 4,
        ..Default::default()
    };
    let bytes = encode_image(&image, &params);
    let full = decode_image(template_like(&image), &params, &bytes);

    // Find the third code block of the HL band at resolution 2 and map its
    // band rectangle to canvas space.
    let probe = j2kexp_rs::TileProcessor::new_decode(&image, &params, 0).unwrap();
    let res = &probe.tile.comps[0].resolutions[2];
    let hl = res.bands.iter().find(|b| b.orient == 1).unwrap();
    let blk = hl.precincts[0].cblks[2].rect;
    let level = 6 - 1 - 2; // decomposition level of resolution 2
    let scale = 1u32 << (level + 1);
    let window = Rect::new(
        (blk.x0 * scale).min(w),
        (blk.y0 * scale).min(h),
        (blk.x1 * scale).min(w),
        (blk.y1 * scale).min(h),
    );
    assert!(!window.is_empty());

    let mut dec = Decompressor::new(params.clone(), template_like(&image)).unwrap();
    dec.set_window(window).unwrap();
    dec.decompress_tile(0, &bytes).unwrap();
    let windowed = dec.into_image();
    for y in window.y0..window.y1 {
        for x in window.x0..window.x1 {
            let idx = (y * w + x) as usize;
            assert_eq!(
                windowed.components[0].data[idx], full.components[0].data[idx],
                "mismatch at ({x},{y})"
            );
        }
    }
}

/// Region-of-interest upshift on one component survives the pipeline.
#[test]
fn roi_shift_lossless_roundtrip() {
    let image = Image::new(128, 128, vec![random_component(128, 128, 8, 0x77)]);
    let params = CodingParams {
        num_resolutions: 3,
        roi_shift: vec![3],
        ..Default::default()
    };
    let bytes = encode_image(&image, &params);
    let decoded = decode_image(template_like(&image), &params, &bytes);
    assert_eq!(image.components[0].data, decoded.components[0].data);
}

/// Rate-targeted layers produce non-decreasing cumulative budgets and a
/// stream that honours the final cap.
#[test]
fn rate_targets_respected() {
    let image = Image::new(256, 256, vec![random_component(256, 256, 8, 0x31)]);
    let params = CodingParams {
        num_resolutions: 5,
        num_layers: 2,
        rates: vec![1.0, 2.0],
        irreversible: true,
        ..Default::default()
    };
    let mut compressor = Compressor::new(params.clone(), &image).unwrap();
    let tile = compressor.compress().unwrap().into_iter().next().unwrap();
    assert!(!tile.rate_infeasible);
    let budget = (2.0 * 256.0 * 256.0 / 8.0) as usize;
    assert!(
        tile.bytes.len() <= budget,
        "{} bytes exceeds the {budget} byte budget",
        tile.bytes.len()
    );
}

/// Packed push-mode input matches the image path.
#[test]
fn packed_tile_input_matches_image_path() {
    let image = Image::new(32, 32, vec![random_component(32, 32, 8, 0x44)]);
    let params = CodingParams {
        num_resolutions: 3,
        ..Default::default()
    };
    let via_image = encode_image(&image, &params);

    let packed: Vec<u8> = image.components[0].data.iter().map(|&v| v as u8).collect();
    let mut compressor = Compressor::new(params.clone(), &image).unwrap();
    let via_packed = compressor
        .compress_tile_from(0, &packed, 1, false)
        .unwrap();
    assert_eq!(via_image, via_packed.bytes);
}

/// Corrupt packet bodies surface as errors, not panics.
#[test]
fn truncated_stream_is_an_error() {
    let image = Image::new(64, 64, vec![random_component(64, 64, 8, 0x13)]);
    let params = CodingParams {
        num_resolutions: 3,
        ..Default::default()
    };
    let bytes = encode_image(&image, &params);
    let mut dec = Decompressor::new(params.clone(), template_like(&image)).unwrap();
    let result = dec.decompress_tile(0, &bytes[..bytes.len() / 3]);
    assert!(result.is_err());
    assert!(!dec.tile_valid(0));
}

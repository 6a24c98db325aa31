//! Tier-2: packet headers and bodies (B.9-B.10), the simulated encoder the
//! rate allocator drives, and packet-length records.
//!
//! A packet covers one (layer, resolution, component, precinct) tuple; its
//! header carries inclusion tag trees, first-inclusion zero-bit-plane
//! counts, the coding-pass ladder, and codeword segment lengths in
//! `numlenbits + floor(log2(passes))` bits.

use log::warn;

use crate::bit_io::{BitReader, BitWriter};
use crate::buffer::TileBuffer;
use crate::coding_params::{
    TileCodingParams, CBLK_STY_LAZY, CBLK_STY_TERMALL, MAX_PRECISION, MAX_RESOLUTIONS,
};
use crate::error::{CodecError, Result};
use crate::image::Image;
use crate::math::floor_log2;
use crate::packet_iterator::{packet_sequence, PacketId};
use crate::tag_tree::TAG_TREE_UNINITIALIZED;
use crate::tile::{Segment, Tile};

const SOP_MARKER: [u8; 2] = [0xFF, 0x91];
const EPH_MARKER: [u8; 2] = [0xFF, 0x92];

/// Passes an MQ codeword segment may hold under each block style.
fn seg_maxpasses(cblksty: u8, prev_maxpasses: Option<u32>, first: bool) -> u32 {
    if cblksty & CBLK_STY_TERMALL != 0 {
        1
    } else if cblksty & CBLK_STY_LAZY != 0 {
        if first {
            10
        } else {
            match prev_maxpasses {
                Some(1) | Some(10) => 2,
                _ => 1,
            }
        }
    } else {
        109
    }
}

fn ensure_segment(segments: &mut Vec<Segment>, segno: usize, cblksty: u8) {
    while segments.len() <= segno {
        let prev = if segments.is_empty() {
            None
        } else {
            Some(segments[segments.len() - 1].maxpasses)
        };
        let first = segments.is_empty();
        segments.push(Segment {
            maxpasses: seg_maxpasses(cblksty, prev, first),
            ..Default::default()
        });
    }
}

/// Result of encoding one tile's packet stream.
#[derive(Debug, Default)]
pub struct PacketStream {
    pub bytes: Vec<u8>,
    /// Per-packet byte counts, in emission order (for PLT records).
    pub packet_lengths: Vec<u32>,
}

/// Encode (or simulate) every packet of the tile up to `max_layers`.
///
/// Simulation runs the identical header machinery so the byte counts match
/// the real pass exactly; only the body copy is skipped. Exceeding
/// `max_len` aborts with `RateControlInfeasible`, which the bisection
/// treats as "does not fit".
pub fn encode_packets(
    tile: &mut Tile,
    tcp: &TileCodingParams,
    image: &Image,
    max_layers: u32,
    max_len: usize,
    simulate: bool,
    collect_lengths: bool,
) -> Result<PacketStream> {
    let sequence = packet_sequence(tile, tcp, image);
    let mut out = PacketStream::default();
    let mut written = 0usize;
    tile.packno = 0;
    for id in sequence {
        if id.layno >= max_layers {
            continue;
        }
        let n = encode_packet(tile, tcp, &id, &mut out.bytes, simulate)?;
        written += n;
        if written > max_len {
            return Err(CodecError::RateControlInfeasible(format!(
                "packet stream exceeds {max_len} bytes"
            )));
        }
        if collect_lengths {
            out.packet_lengths.push(n as u32);
        }
        tile.packno += 1;
    }
    Ok(out)
}

fn encode_packet(
    tile: &mut Tile,
    tcp: &TileCodingParams,
    id: &PacketId,
    out: &mut Vec<u8>,
    simulate: bool,
) -> Result<usize> {
    let compno = id.compno as usize;
    let resno = id.resno as usize;
    let precno = id.precno as usize;
    let layno = id.layno as usize;
    let roi_shift = tcp.components[compno].roi_shift;
    let mut bytes = 0usize;

    if tcp.use_sop {
        if !simulate {
            out.extend_from_slice(&SOP_MARKER);
            out.extend_from_slice(&[0x00, 0x04]);
            out.push((tile.packno >> 8) as u8);
            out.push(tile.packno as u8);
        }
        bytes += 6;
    }

    // First layer: reset the precinct's coding state.
    if layno == 0 {
        let res = &mut tile.comps[compno].resolutions[resno];
        for band in &mut res.bands {
            if band.is_empty() {
                continue;
            }
            let band_numbps = band.numbps + roi_shift;
            let prc = &mut band.precincts[precno];
            prc.incl_tree.reset();
            prc.imsb_tree.reset();
            for (cblkno, cblk) in prc.cblks.iter_mut().enumerate() {
                cblk.num_passes_included_in_current_layer = 0;
                let zero_planes = band_numbps.saturating_sub(cblk.numbps);
                prc.imsb_tree.set_value(cblkno as u32, zero_planes);
            }
        }
    }

    let mut bio = BitWriter::new();
    // Non-empty packet bit; this encoder always emits full headers.
    bio.put_bit(1);

    {
        let res = &mut tile.comps[compno].resolutions[resno];
        for band in &mut res.bands {
            if band.is_empty() {
                continue;
            }
            let prc = &mut band.precincts[precno];
            for (cblkno, cblk) in prc.cblks.iter().enumerate() {
                if cblk.num_passes_included_in_current_layer == 0
                    && cblk.layers[layno].numpasses > 0
                {
                    prc.incl_tree.set_value(cblkno as u32, id.layno);
                }
            }
            for (cblkno, cblk) in prc.cblks.iter_mut().enumerate() {
                let layer = cblk.layers[layno];
                // Inclusion: tag tree for first-timers, one bit afterwards.
                if cblk.num_passes_included_in_current_layer == 0 {
                    prc.incl_tree.encode(&mut bio, cblkno as u32, id.layno + 1);
                } else {
                    bio.put_bit(u32::from(layer.numpasses != 0));
                }
                if layer.numpasses == 0 {
                    continue;
                }
                if cblk.num_passes_included_in_current_layer == 0 {
                    cblk.numlenbits = 3;
                    prc.imsb_tree
                        .encode(&mut bio, cblkno as u32, TAG_TREE_UNINITIALIZED);
                }
                bio.put_num_passes(layer.numpasses);

                // Length-indicator growth over this packet's segments.
                let first = cblk.num_passes_included_in_current_layer as usize;
                let last = first + layer.numpasses as usize;
                let mut increment = 0i32;
                let mut len = 0u32;
                let mut nump = 0u32;
                for passno in first..last {
                    let pass = &cblk.passes[passno];
                    nump += 1;
                    len += pass.len;
                    if pass.term || passno + 1 == last {
                        let bits_needed = floor_log2(len.max(1)) as i32 + 1;
                        increment = increment
                            .max(bits_needed - (cblk.numlenbits as i32 + floor_log2(nump) as i32));
                        len = 0;
                        nump = 0;
                    }
                }
                let increment = increment.max(0) as u32;
                bio.put_comma_code(increment);
                cblk.numlenbits += increment;

                // Segment lengths.
                let mut len = 0u32;
                let mut nump = 0u32;
                for passno in first..last {
                    let pass = &cblk.passes[passno];
                    nump += 1;
                    len += pass.len;
                    if pass.term || passno + 1 == last {
                        bio.put_bits(len, cblk.numlenbits + floor_log2(nump));
                        len = 0;
                        nump = 0;
                    }
                }
            }
        }
    }
    bio.flush();
    bytes += bio.num_bytes();
    if !simulate {
        out.extend_from_slice(bio.bytes());
    }

    if tcp.use_eph {
        if !simulate {
            out.extend_from_slice(&EPH_MARKER);
        }
        bytes += 2;
    }

    // Packet body: each included block's layer bytes, raster order.
    let res = &mut tile.comps[compno].resolutions[resno];
    for band in &mut res.bands {
        if band.is_empty() {
            continue;
        }
        let prc = &mut band.precincts[precno];
        for cblk in prc.cblks.iter_mut() {
            let layer = cblk.layers[layno];
            if layer.numpasses == 0 {
                continue;
            }
            if layer.len > 0 {
                if !simulate {
                    let start = layer.data_start as usize;
                    let end = start + layer.len as usize;
                    if end > cblk.data.len() {
                        return Err(CodecError::OutOfBounds(format!(
                            "layer slice {start}..{end} outside {} block bytes",
                            cblk.data.len()
                        )));
                    }
                    out.extend_from_slice(&cblk.data[start..end]);
                }
                bytes += layer.len as usize;
            }
            cblk.num_passes_included_in_current_layer += layer.numpasses;
        }
    }

    Ok(bytes)
}

/// Decode the packet stream of one tile part. Precincts that miss the
/// decode window are parsed but their body bytes are skipped.
pub fn decode_packets(
    tile: &mut Tile,
    tcp: &TileCodingParams,
    image: &Image,
    bufs: &[TileBuffer],
    src: &[u8],
) -> Result<usize> {
    let sequence = packet_sequence(tile, tcp, image);
    let mut pos = 0usize;
    for id in sequence {
        if id.layno >= tcp.num_layers {
            continue;
        }
        let compno = id.compno as usize;
        let resno = id.resno as usize;
        let keep = {
            let res = &tile.comps[compno].resolutions[resno];
            res.bands.iter().any(|band| {
                !band.is_empty()
                    && bufs[compno].precinct_in_window(
                        resno,
                        band.orient,
                        &band.precincts[id.precno as usize].rect,
                    )
            })
        };
        pos += decode_packet(tile, tcp, &id, &src[pos..], keep)?;
        if pos > src.len() {
            return Err(CodecError::CorruptInput(
                "packet body ran past the tile part".into(),
            ));
        }
    }
    Ok(pos)
}

fn decode_packet(
    tile: &mut Tile,
    tcp: &TileCodingParams,
    id: &PacketId,
    src: &[u8],
    keep_data: bool,
) -> Result<usize> {
    let compno = id.compno as usize;
    let resno = id.resno as usize;
    let precno = id.precno as usize;
    let cblksty = tcp.components[compno].cblk_sty;
    let roi_shift = tcp.components[compno].roi_shift;
    let num_resolutions = tcp.components[compno].num_resolutions;
    let mut pos = 0usize;

    // First layer: reset the precinct's decode state.
    if id.layno == 0 {
        let res = &mut tile.comps[compno].resolutions[resno];
        for band in &mut res.bands {
            if band.is_empty() {
                continue;
            }
            let prc = band
                .precincts
                .get_mut(precno)
                .ok_or_else(|| CodecError::OutOfBounds("precinct outside band".into()))?;
            prc.incl_tree.reset();
            prc.imsb_tree.reset();
            for cblk in &mut prc.cblks {
                cblk.reset_decode();
            }
        }
    }

    if tcp.use_sop {
        if src.len() < 6 {
            warn!("not enough bytes for the expected SOP marker");
        } else if src[0..2] != SOP_MARKER {
            warn!("expected SOP marker before packet {}", tile.packno);
        } else {
            pos += 6;
        }
    }

    let mut bio = BitReader::new(&src[pos..]);
    let present = bio.get_bit()?;
    if present == 0 {
        bio.align()?;
        pos += bio.num_bytes();
        if tcp.use_eph {
            if src.len() >= pos + 2 && src[pos..pos + 2] == EPH_MARKER {
                pos += 2;
            } else {
                warn!("expected EPH marker after empty packet header");
            }
        }
        return Ok(pos);
    }

    {
        let res = &mut tile.comps[compno].resolutions[resno];
        for band in &mut res.bands {
            if band.is_empty() {
                continue;
            }
            let band_numbps = band.numbps + roi_shift;
            let prc = &mut band.precincts[precno];
            for (cblkno, cblk) in prc.cblks.iter_mut().enumerate() {
                let first_time = cblk.num_segments == 0;
                let included = if first_time {
                    prc.incl_tree
                        .decode(&mut bio, cblkno as u32, id.layno + 1)?
                } else {
                    bio.get_bit()? == 1
                };
                if !included {
                    cblk.num_passes_in_packet = 0;
                    continue;
                }

                if first_time {
                    let mut i = 1u32;
                    while !prc.imsb_tree.decode(&mut bio, cblkno as u32, i)? {
                        i += 1;
                        if i > TAG_TREE_UNINITIALIZED {
                            return Err(CodecError::CorruptInput(
                                "zero-bit-plane tag tree does not resolve".into(),
                            ));
                        }
                    }
                    let zero_planes = i - 1;
                    cblk.numbps = (band_numbps + 1).saturating_sub(zero_planes + 1);
                    if cblk.numbps > MAX_PRECISION + 5 * num_resolutions.min(MAX_RESOLUTIONS) {
                        warn!(
                            "implausible bit-plane count {}, failing code block",
                            cblk.numbps
                        );
                        cblk.failed = true;
                    }
                    cblk.numlenbits = 3;
                }

                let numpasses = bio.get_num_passes()?;
                if numpasses > 164 {
                    warn!("{numpasses} passes in one packet is suspicious");
                }
                cblk.num_passes_in_packet = numpasses;
                let increment = bio.get_comma_code()?;
                cblk.numlenbits += increment;

                let mut segno = if first_time {
                    ensure_segment(&mut cblk.segments, 0, cblksty);
                    0usize
                } else {
                    let mut s = cblk.num_segments - 1;
                    if cblk.segments[s].numpasses == cblk.segments[s].maxpasses {
                        s += 1;
                        ensure_segment(&mut cblk.segments, s, cblksty);
                    }
                    s
                };

                let mut remaining = numpasses as i64;
                loop {
                    let seg = &mut cblk.segments[segno];
                    seg.numpasses_in_packet =
                        ((seg.maxpasses - seg.numpasses) as i64).min(remaining) as u32;
                    let bits = cblk.numlenbits + floor_log2(seg.numpasses_in_packet.max(1));
                    if bits > 32 {
                        return Err(CodecError::CorruptInput(format!(
                            "segment length coded in {bits} bits"
                        )));
                    }
                    seg.newlen = bio.get_bits(bits)?;
                    remaining -= seg.numpasses_in_packet as i64;
                    if remaining > 0 {
                        segno += 1;
                        ensure_segment(&mut cblk.segments, segno, cblksty);
                    } else {
                        break;
                    }
                }
            }
        }
    }

    bio.align()?;
    pos += bio.num_bytes();

    if tcp.use_eph {
        if src.len() >= pos + 2 && src[pos..pos + 2] == EPH_MARKER {
            pos += 2;
        } else {
            warn!("expected EPH marker after packet header");
        }
    }

    // Packet body.
    let res = &mut tile.comps[compno].resolutions[resno];
    for band in &mut res.bands {
        if band.is_empty() {
            continue;
        }
        let prc = &mut band.precincts[precno];
        for cblk in prc.cblks.iter_mut() {
            if cblk.num_passes_in_packet == 0 {
                continue;
            }
            let mut segno = if cblk.num_segments == 0 {
                cblk.num_segments = 1;
                ensure_segment(&mut cblk.segments, 0, cblksty);
                0usize
            } else {
                let mut s = cblk.num_segments - 1;
                if cblk.segments[s].numpasses == cblk.segments[s].maxpasses {
                    s += 1;
                    cblk.num_segments += 1;
                    ensure_segment(&mut cblk.segments, s, cblksty);
                }
                s
            };

            let mut remaining = cblk.num_passes_in_packet as i64;
            loop {
                ensure_segment(&mut cblk.segments, segno, cblksty);
                let newlen = cblk.segments[segno].newlen as usize;
                if pos + newlen > src.len() {
                    return Err(CodecError::CorruptInput(format!(
                        "segment of {newlen} bytes overruns the source buffer"
                    )));
                }
                {
                    let seg = &mut cblk.segments[segno];
                    if seg.numpasses == 0 {
                        seg.dataindex = cblk.compressed.len() as u32;
                    }
                }
                if newlen > 0 {
                    if keep_data && !cblk.failed {
                        cblk.compressed.extend_from_slice(&src[pos..pos + newlen]);
                        cblk.segments[segno].len += newlen as u32;
                    }
                    pos += newlen;
                }
                let seg = &mut cblk.segments[segno];
                seg.numpasses += seg.numpasses_in_packet;
                remaining -= seg.numpasses_in_packet as i64;
                if remaining > 0 {
                    segno += 1;
                    cblk.num_segments += 1;
                } else {
                    break;
                }
            }
        }
    }

    Ok(pos)
}

// ----- packet length records (PLT payloads) --------------------------------

/// Largest payload one PLT marker segment can carry (65535 minus the
/// length and index fields).
const PLT_PAYLOAD_CAP: usize = 65532;

/// Serialize packet lengths into PLT marker-segment payloads (Iplt bytes:
/// 7-bit big-endian groups, continuation in the top bit). Marker framing
/// and the Zplt index belong to the code-stream writer.
pub fn plt_payloads(lengths: &[u32]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut cur: Vec<u8> = Vec::new();
    for &len in lengths {
        let mut enc = [0u8; 5];
        let mut n = 0;
        let mut v = len;
        loop {
            enc[n] = (v & 0x7F) as u8;
            n += 1;
            v >>= 7;
            if v == 0 {
                break;
            }
        }
        if cur.len() + n > PLT_PAYLOAD_CAP {
            out.push(std::mem::take(&mut cur));
        }
        for i in (0..n).rev() {
            let mut b = enc[i];
            if i > 0 {
                b |= 0x80;
            }
            cur.push(b);
        }
    }
    if !cur.is_empty() || out.is_empty() {
        out.push(cur);
    }
    out
}

/// Byte offset of packet `index` inside a tile part, given its length
/// records: the skip-without-parsing path the length markers exist for.
pub fn packet_offset(lengths: &[u32], index: usize) -> usize {
    lengths[..index.min(lengths.len())]
        .iter()
        .map(|&n| n as usize)
        .sum()
}

/// Parse one PLT payload back into packet lengths.
pub fn parse_plt_payload(bytes: &[u8]) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    let mut acc = 0u64;
    let mut open = false;
    for &b in bytes {
        acc = (acc << 7) | (b & 0x7F) as u64;
        if acc > u32::MAX as u64 {
            return Err(CodecError::CorruptInput(
                "packet length record overflows 32 bits".into(),
            ));
        }
        if b & 0x80 != 0 {
            open = true;
        } else {
            out.push(acc as u32);
            acc = 0;
            open = false;
        }
    }
    if open {
        return Err(CodecError::CorruptInput(
            "truncated packet length record".into(),
        ));
    }
    Ok(out)
}

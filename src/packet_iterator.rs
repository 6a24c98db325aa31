//! Packet enumeration: the (layer, resolution, component, precinct)
//! sequence in each of the five progression orders, with
//! progression-order-change records overriding axis ranges.
//!
//! The sequence is materialized eagerly; positional orders sort precinct
//! origins by their canvas coordinates, which reproduces the standard's
//! grid walk without its modular arithmetic. Compressor and decompressor
//! call the same builder, so packet order always agrees.

use crate::coding_params::{PocRecord, ProgressionOrder, TileCodingParams};
use crate::image::Image;
use crate::math::floor_div_pow2;
use crate::tile::Tile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId {
    pub layno: u32,
    pub resno: u32,
    pub compno: u32,
    pub precno: u32,
}

/// One precinct with its canvas-space sort keys.
#[derive(Debug, Clone, Copy)]
struct PrecinctPos {
    key_y: u64,
    key_x: u64,
    compno: u32,
    resno: u32,
    precno: u32,
}

fn precinct_positions(tile: &Tile, tcp: &TileCodingParams, image: &Image) -> Vec<PrecinctPos> {
    let mut out = Vec::new();
    for (compno, comp) in tile.comps.iter().enumerate() {
        let tccp = &tcp.components[compno];
        let (dx, dy) = (
            image.components[compno].dx as u64,
            image.components[compno].dy as u64,
        );
        for (resno, res) in comp.resolutions.iter().enumerate() {
            if res.num_precincts() == 0 {
                continue;
            }
            let level = comp.num_resolutions - 1 - resno as u32;
            let (pdx, pdy) = tccp.precincts[resno];
            let tl_px = floor_div_pow2(res.rect.x0, pdx) << pdx;
            let tl_py = floor_div_pow2(res.rect.y0, pdy) << pdy;
            for precno in 0..res.num_precincts() {
                let px = tl_px as u64 + ((precno % res.pw) as u64) * (1u64 << pdx);
                let py = tl_py as u64 + ((precno / res.pw) as u64) * (1u64 << pdy);
                out.push(PrecinctPos {
                    key_y: (py << level) * dy,
                    key_x: (px << level) * dx,
                    compno: compno as u32,
                    resno: resno as u32,
                    precno,
                });
            }
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn emit_segment(
    out: &mut Vec<PacketId>,
    seen: &mut std::collections::HashSet<PacketId>,
    positions: &[PrecinctPos],
    order: ProgressionOrder,
    layers: std::ops::Range<u32>,
    res: std::ops::Range<u32>,
    comps: std::ops::Range<u32>,
) {
    let in_range = |p: &PrecinctPos| res.contains(&p.resno) && comps.contains(&p.compno);
    let mut push = |out: &mut Vec<PacketId>, id: PacketId| {
        if seen.insert(id) {
            out.push(id);
        }
    };
    match order {
        ProgressionOrder::Lrcp => {
            for layno in layers.clone() {
                for resno in res.clone() {
                    for compno in comps.clone() {
                        for p in positions.iter().filter(|p| p.resno == resno && p.compno == compno) {
                            push(out, PacketId { layno, resno, compno, precno: p.precno });
                        }
                    }
                }
            }
        }
        ProgressionOrder::Rlcp => {
            for resno in res.clone() {
                for layno in layers.clone() {
                    for compno in comps.clone() {
                        for p in positions.iter().filter(|p| p.resno == resno && p.compno == compno) {
                            push(out, PacketId { layno, resno, compno, precno: p.precno });
                        }
                    }
                }
            }
        }
        ProgressionOrder::Rpcl => {
            let mut ps: Vec<&PrecinctPos> = positions.iter().filter(|p| in_range(p)).collect();
            ps.sort_by_key(|p| (p.resno, p.key_y, p.key_x, p.compno, p.precno));
            for p in ps {
                for layno in layers.clone() {
                    push(
                        out,
                        PacketId { layno, resno: p.resno, compno: p.compno, precno: p.precno },
                    );
                }
            }
        }
        ProgressionOrder::Pcrl => {
            let mut ps: Vec<&PrecinctPos> = positions.iter().filter(|p| in_range(p)).collect();
            ps.sort_by_key(|p| (p.key_y, p.key_x, p.compno, p.resno, p.precno));
            for p in ps {
                for layno in layers.clone() {
                    push(
                        out,
                        PacketId { layno, resno: p.resno, compno: p.compno, precno: p.precno },
                    );
                }
            }
        }
        ProgressionOrder::Cprl => {
            let mut ps: Vec<&PrecinctPos> = positions.iter().filter(|p| in_range(p)).collect();
            ps.sort_by_key(|p| (p.compno, p.key_y, p.key_x, p.resno, p.precno));
            for p in ps {
                for layno in layers.clone() {
                    push(
                        out,
                        PacketId { layno, resno: p.resno, compno: p.compno, precno: p.precno },
                    );
                }
            }
        }
    }
}

/// The packet sequence of one tile, POC records first, then the tile's
/// base progression covering whatever remains.
pub fn packet_sequence(tile: &Tile, tcp: &TileCodingParams, image: &Image) -> Vec<PacketId> {
    let positions = precinct_positions(tile, tcp, image);
    let num_comps = tile.comps.len() as u32;
    let max_res = tile
        .comps
        .iter()
        .map(|c| c.num_resolutions)
        .max()
        .unwrap_or(0);

    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for poc in &tcp.pocs {
        let poc: &PocRecord = poc;
        emit_segment(
            &mut out,
            &mut seen,
            &positions,
            poc.order,
            0..poc.layer_end.min(tcp.num_layers),
            poc.res_start..poc.res_end.min(max_res),
            poc.comp_start..poc.comp_end.min(num_comps),
        );
    }
    emit_segment(
        &mut out,
        &mut seen,
        &positions,
        tcp.progression,
        0..tcp.num_layers,
        0..max_res,
        0..num_comps,
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding_params::CodingParams;
    use crate::image::ImageComponent;
    use crate::quantization::calc_explicit_stepsizes;
    use crate::tile::init_tile;

    fn setup(order: ProgressionOrder, precinct: Option<(u32, u32)>) -> (Image, CodingParams, TileCodingParams, Tile) {
        let image = Image::new(64, 64, vec![
            ImageComponent::new(64, 64, 8, false),
            ImageComponent::new(64, 64, 8, false),
        ]);
        let params = CodingParams {
            num_resolutions: 3,
            num_layers: 2,
            progression: order,
            precinct_sizes: precinct.map(|p| vec![p]).unwrap_or_default(),
            ..Default::default()
        };
        let mut tcp = TileCodingParams::from_params(&params, 2);
        for comp in &mut tcp.components {
            calc_explicit_stepsizes(comp, 8);
        }
        let tile = init_tile(&image, &params, &tcp, 0, 1.0).unwrap();
        (image, params, tcp, tile)
    }

    fn total_packets(tile: &Tile, layers: u32) -> usize {
        let mut n = 0usize;
        for comp in &tile.comps {
            for res in &comp.resolutions {
                n += res.num_precincts() as usize;
            }
        }
        n * layers as usize
    }

    #[test]
    fn test_all_orders_complete_no_duplicates() {
        for order in [
            ProgressionOrder::Lrcp,
            ProgressionOrder::Rlcp,
            ProgressionOrder::Rpcl,
            ProgressionOrder::Pcrl,
            ProgressionOrder::Cprl,
        ] {
            let (image, _params, tcp, tile) = setup(order, Some((5, 5)));
            let seq = packet_sequence(&tile, &tcp, &image);
            assert_eq!(seq.len(), total_packets(&tile, 2), "order {order:?}");
            let set: std::collections::HashSet<_> = seq.iter().collect();
            assert_eq!(set.len(), seq.len(), "duplicates under {order:?}");
        }
    }

    #[test]
    fn test_lrcp_layer_major() {
        let (image, _params, tcp, tile) = setup(ProgressionOrder::Lrcp, None);
        let seq = packet_sequence(&tile, &tcp, &image);
        let half = seq.len() / 2;
        assert!(seq[..half].iter().all(|p| p.layno == 0));
        assert!(seq[half..].iter().all(|p| p.layno == 1));
    }

    #[test]
    fn test_rlcp_resolution_major() {
        let (image, _params, tcp, tile) = setup(ProgressionOrder::Rlcp, None);
        let seq = packet_sequence(&tile, &tcp, &image);
        let mut last_res = 0;
        for p in &seq {
            assert!(p.resno >= last_res);
            last_res = p.resno;
        }
    }

    #[test]
    fn test_cprl_component_major() {
        let (image, _params, tcp, tile) = setup(ProgressionOrder::Cprl, Some((4, 4)));
        let seq = packet_sequence(&tile, &tcp, &image);
        let mut last_comp = 0;
        for p in &seq {
            assert!(p.compno >= last_comp);
            last_comp = p.compno;
        }
    }

    #[test]
    fn test_poc_reorders_prefix() {
        let (image, mut params, mut tcp, tile) = {
            let (i, p, t, tile) = setup(ProgressionOrder::Lrcp, None);
            (i, p, t, tile)
        };
        params.pocs.push(crate::coding_params::PocRecord {
            res_start: 0,
            comp_start: 0,
            layer_end: 2,
            res_end: 1,
            comp_end: 2,
            order: ProgressionOrder::Rlcp,
        });
        tcp.pocs = params.pocs.clone();
        let seq = packet_sequence(&tile, &tcp, &image);
        // Same packet population, no duplicates.
        assert_eq!(seq.len(), total_packets(&tile, 2));
        let set: std::collections::HashSet<_> = seq.iter().collect();
        assert_eq!(set.len(), seq.len());
        // The POC segment puts all resolution-0 packets first.
        let r0_count = tile
            .comps
            .iter()
            .map(|c| c.resolutions[0].num_precincts() as usize)
            .sum::<usize>()
            * 2;
        assert!(seq[..r0_count].iter().all(|p| p.resno == 0));
    }
}

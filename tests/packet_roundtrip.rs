//! Tier-2 packet codec round-trip tests.

use j2k_packet_rs::coding_parameters::{
    CodeblockStyle, CodingParameters, PackedHeaderMode, ProgressionChange, ProgressionOrder,
};
use j2k_packet_rs::error::Tier2Error;
use j2k_packet_rs::packet::{
    DecodeMode, EncodeMode, PacketHeaderSource, decode_packets, encode_packets,
};
use j2k_packet_rs::rate_control::rate_allocate;
use j2k_packet_rs::tile::{CodingPass, ComponentParams, Tile, TileParams};

fn simple_tile_params(size: u32, cblk_exp: u32, num_layers: u32) -> TileParams {
    TileParams {
        x0: 0,
        y0: 0,
        x1: size,
        y1: size,
        num_layers,
        components: vec![ComponentParams {
            cblk_w_exp: cblk_exp,
            cblk_h_exp: cblk_exp,
            ..ComponentParams::default()
        }],
    }
}

/// Fill a codeblock with `n` passes of `pass_bytes` bytes each, with a
/// convex distortion curve.
fn fill_passes(tile: &mut Tile, compno: usize, resno: usize, cblkno: usize, n: u32, pass_bytes: u32) {
    let cblk =
        &mut tile.components[compno].resolutions[resno].bands[0].precincts[0].codeblocks[cblkno];
    cblk.num_bps = 5;
    cblk.passes = (1..=n)
        .map(|p| CodingPass {
            rate: p * pass_bytes,
            distortion: 100.0 * (1.0 - 0.5f64.powi(p as i32)),
            terminates: false,
        })
        .collect();
    cblk.data = (0..n * pass_bytes).map(|i| (i * 7 + cblkno as u32) as u8).collect();
}

fn first_codeblock(tile: &Tile) -> &j2k_packet_rs::tile::Codeblock {
    &tile.components[0].resolutions[0].bands[0].precincts[0].codeblocks[0]
}

#[test]
fn test_scenario_a_all_empty_codeblocks() {
    // A 1-component, 1-resolution, 1-precinct, 1-layer tile whose
    // codeblocks have no passes encodes to a single zero bit plus byte
    // alignment, and decodes to zero included codeblocks.
    let mut tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    let params = CodingParameters::default();

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 64];
    let written = encode_packets(&mut tile, &params, &mut dest, EncodeMode::FinalPass, None, None)
        .unwrap()
        .unwrap();
    assert_eq!(written, 1);
    assert_eq!(dest[0], 0x00);

    let mut dec_tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    let consumed =
        decode_packets(&mut dec_tile, &params, &dest[..written], None, DecodeMode::Strict).unwrap();
    assert_eq!(consumed, 1);
    assert!(!first_codeblock(&dec_tile).included);
    assert!(first_codeblock(&dec_tile).segments.is_empty());
}

#[test]
fn test_scenario_b_three_pass_inclusion() {
    // A codeblock newly included with 3 passes: the header decodes back
    // to numnewpasses == 3 and the body is exactly the sum of the
    // incremental pass rates.
    let mut tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    fill_passes(&mut tile, 0, 0, 0, 3, 4);
    let params = CodingParameters::default();

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 256];
    let written = encode_packets(&mut tile, &params, &mut dest, EncodeMode::FinalPass, None, None)
        .unwrap()
        .unwrap();

    let mut dec_tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    let consumed =
        decode_packets(&mut dec_tile, &params, &dest[..written], None, DecodeMode::Strict).unwrap();
    assert_eq!(consumed, written);

    let cblk = first_codeblock(&dec_tile);
    assert!(cblk.included);
    assert_eq!(cblk.decoded_passes(), 3);
    assert_eq!(cblk.zero_bit_planes, 3); // band 8 bps, block 5
    assert_eq!(cblk.num_bps, 5);

    let body_len: u32 = cblk.segments.iter().map(|s| s.len).sum();
    assert_eq!(body_len, 12);
    // The resolved ranges are zero-copy slices of the packet stream.
    let enc_cblk = first_codeblock(&tile);
    let mut recovered = Vec::new();
    for seg in &cblk.segments {
        recovered.extend_from_slice(&dest[seg.start..seg.start + seg.len as usize]);
    }
    assert_eq!(recovered, enc_cblk.data[..12]);
}

#[test]
fn test_scenario_c_lazy_segmentation() {
    // LAZY segment capacities run 10, 2, 1, 2, 1, ...; a 15-pass
    // codeblock splits into segments of exactly 10, 2, 1 and 2 passes.
    let style = CodeblockStyle {
        bypass: true,
        ..CodeblockStyle::default()
    };
    let params = CodingParameters {
        cblk_style: style,
        ..CodingParameters::default()
    };

    let mut tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    fill_passes(&mut tile, 0, 0, 0, 15, 2);
    {
        let cblk = &mut tile.components[0].resolutions[0].bands[0].precincts[0].codeblocks[0];
        // Terminations at the LAZY segment boundaries.
        for term in [9usize, 11, 12, 14] {
            cblk.passes[term].terminates = true;
        }
    }

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 256];
    let written = encode_packets(&mut tile, &params, &mut dest, EncodeMode::FinalPass, None, None)
        .unwrap()
        .unwrap();

    let mut dec_tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    decode_packets(&mut dec_tile, &params, &dest[..written], None, DecodeMode::Strict).unwrap();

    let cblk = first_codeblock(&dec_tile);
    let passes: Vec<u32> = cblk.segments.iter().map(|s| s.num_passes).collect();
    assert_eq!(passes, vec![10, 2, 1, 2]);
    let lens: Vec<u32> = cblk.segments.iter().map(|s| s.len).collect();
    assert_eq!(lens, vec![20, 4, 2, 4]);
}

#[test]
fn test_multi_layer_roundtrip() {
    let mut tile = Tile::build(&simple_tile_params(64, 5, 2)).unwrap();
    // A 64x64 tile with 32x32 codeblocks: a 2x2 grid.
    for cblkno in 0..4 {
        fill_passes(&mut tile, 0, 0, cblkno, 6, 3);
    }
    let params = CodingParameters {
        num_layers: 2,
        layer_rates: vec![40.0, 0.0],
        ..CodingParameters::default()
    };

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 1 << 12];
    let written = encode_packets(&mut tile, &params, &mut dest, EncodeMode::FinalPass, None, None)
        .unwrap()
        .unwrap();

    let mut dec_tile = Tile::build(&simple_tile_params(64, 5, 2)).unwrap();
    let consumed =
        decode_packets(&mut dec_tile, &params, &dest[..written], None, DecodeMode::Strict).unwrap();
    assert_eq!(consumed, written);

    // Every codeblock's decoded passes match the committed allocation and
    // its segment chunks reassemble the committed data prefix.
    for cblkno in 0..4 {
        let enc = &tile.components[0].resolutions[0].bands[0].precincts[0].codeblocks[cblkno];
        let dec = &dec_tile.components[0].resolutions[0].bands[0].precincts[0].codeblocks[cblkno];
        assert_eq!(dec.decoded_passes(), enc.num_passes_in_layers);
        let mut recovered = Vec::new();
        for seg in &dec.segments {
            recovered.extend_from_slice(&dest[seg.start..seg.start + seg.len as usize]);
        }
        let committed: usize = enc
            .layers
            .iter()
            .map(|l| l.len as usize)
            .sum();
        assert_eq!(recovered, enc.data[..committed]);
    }
}

#[test]
fn test_empty_layer_packet_is_one_byte() {
    // All passes fit layer 0; the layer-1 packet is the 1-bit empty
    // header, and decoding it adds no passes.
    let mut tile = Tile::build(&simple_tile_params(64, 6, 2)).unwrap();
    fill_passes(&mut tile, 0, 0, 0, 3, 4);
    let params = CodingParameters {
        num_layers: 2,
        ..CodingParameters::default()
    };

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 256];
    let written = encode_packets(&mut tile, &params, &mut dest, EncodeMode::FinalPass, None, None)
        .unwrap()
        .unwrap();
    // Layer 1 contributes exactly one empty-header byte at the end.
    assert_eq!(dest[written - 1], 0x00);

    let mut dec_tile = Tile::build(&simple_tile_params(64, 6, 2)).unwrap();
    decode_packets(&mut dec_tile, &params, &dest[..written], None, DecodeMode::Strict).unwrap();
    assert_eq!(first_codeblock(&dec_tile).decoded_passes(), 3);
}

#[test]
fn test_sop_eph_markers() {
    let mut tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    fill_passes(&mut tile, 0, 0, 0, 2, 4);
    let params = CodingParameters {
        use_sop: true,
        use_eph: true,
        ..CodingParameters::default()
    };

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 256];
    let written = encode_packets(&mut tile, &params, &mut dest, EncodeMode::FinalPass, None, None)
        .unwrap()
        .unwrap();

    // SOP marker segment with packet counter 0 leads the stream.
    assert_eq!(&dest[..6], &[0xFF, 0x91, 0x00, 0x04, 0x00, 0x00]);
    // An EPH marker terminates the header.
    assert!(
        (6..written - 1).any(|i| dest[i] == 0xFF && dest[i + 1] == 0x92),
        "no EPH marker found"
    );

    let mut dec_tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    let consumed =
        decode_packets(&mut dec_tile, &params, &dest[..written], None, DecodeMode::Strict).unwrap();
    assert_eq!(consumed, written);
    assert_eq!(first_codeblock(&dec_tile).decoded_passes(), 2);
}

#[test]
fn test_packed_headers_ppt() {
    // With PPT, the tile stream carries only SOP markers and bodies;
    // headers travel in the side channel with the same bit format.
    let mut tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    fill_passes(&mut tile, 0, 0, 0, 3, 4);
    let params = CodingParameters {
        packed_headers: PackedHeaderMode::Tile,
        ..CodingParameters::default()
    };

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 256];
    let mut headers = Vec::new();
    let written = encode_packets(
        &mut tile,
        &params,
        &mut dest,
        EncodeMode::FinalPass,
        None,
        Some(&mut headers),
    )
    .unwrap()
    .unwrap();

    assert!(!headers.is_empty());
    // The body stream holds the codeblock data verbatim from offset 0.
    let enc = first_codeblock(&tile);
    assert_eq!(&dest[..12], &enc.data[..12]);
    assert_eq!(written, 12);

    let mut dec_tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    let consumed = decode_packets(
        &mut dec_tile,
        &params,
        &dest[..written],
        Some(&headers),
        DecodeMode::Strict,
    )
    .unwrap();
    assert_eq!(consumed, written);
    assert_eq!(first_codeblock(&dec_tile).decoded_passes(), 3);
}

#[test]
fn test_truncated_body_strict_vs_lenient() {
    let mut tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    fill_passes(&mut tile, 0, 0, 0, 3, 4);
    let params = CodingParameters::default();

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 256];
    let written = encode_packets(&mut tile, &params, &mut dest, EncodeMode::FinalPass, None, None)
        .unwrap()
        .unwrap();

    // Drop the last body bytes.
    let truncated = &dest[..written - 4];

    let mut strict_tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    assert_eq!(
        decode_packets(&mut strict_tile, &params, truncated, None, DecodeMode::Strict),
        Err(Tier2Error::TruncatedPacketBody)
    );

    let mut lenient_tile = Tile::build(&simple_tile_params(64, 6, 1)).unwrap();
    decode_packets(&mut lenient_tile, &params, truncated, None, DecodeMode::Lenient).unwrap();
    let cblk = first_codeblock(&lenient_tile);
    assert!(cblk.corrupted);
    assert!(cblk.segments.is_empty());
}

#[test]
fn test_corruption_does_not_spread_to_siblings() {
    // Two codeblocks in one precinct; the stream is cut inside the
    // second block's chunk. The first block must decode intact.
    let mut tile = Tile::build(&simple_tile_params(64, 5, 1)).unwrap();
    for cblkno in 0..4 {
        fill_passes(&mut tile, 0, 0, cblkno, 2, 4);
    }
    let params = CodingParameters::default();

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 512];
    let written = encode_packets(&mut tile, &params, &mut dest, EncodeMode::FinalPass, None, None)
        .unwrap()
        .unwrap();

    let truncated = &dest[..written - 6];
    let mut dec_tile = Tile::build(&simple_tile_params(64, 5, 1)).unwrap();
    decode_packets(&mut dec_tile, &params, truncated, None, DecodeMode::Lenient).unwrap();

    let blocks = &dec_tile.components[0].resolutions[0].bands[0].precincts[0].codeblocks;
    assert!(!blocks[0].corrupted);
    assert_eq!(blocks[0].decoded_passes(), 2);
    assert!(blocks.iter().any(|c| c.corrupted));
}

#[test]
fn test_truncation_at_packet_boundary_is_clean() {
    // Layered streams are truncatable: cutting between packets decodes
    // the remaining prefix without error.
    let mut tile = Tile::build(&simple_tile_params(64, 6, 2)).unwrap();
    fill_passes(&mut tile, 0, 0, 0, 6, 3);
    let params = CodingParameters {
        num_layers: 2,
        layer_rates: vec![14.0, 0.0],
        ..CodingParameters::default()
    };

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 512];
    let full = encode_packets(&mut tile, &params, &mut dest, EncodeMode::FinalPass, None, None)
        .unwrap()
        .unwrap();

    // Re-encode only layer 0 to find the boundary.
    let mut tile2 = Tile::build(&simple_tile_params(64, 6, 2)).unwrap();
    fill_passes(&mut tile2, 0, 0, 0, 6, 3);
    rate_allocate(&mut tile2, &params, 1 << 16).unwrap();
    let mut dest2 = vec![0u8; 512];
    let layer0_len =
        encode_packets(&mut tile2, &params, &mut dest2, EncodeMode::FinalPass, Some(1), None)
            .unwrap()
            .unwrap();
    assert!(layer0_len < full);

    let mut dec_tile = Tile::build(&simple_tile_params(64, 6, 2)).unwrap();
    let consumed = decode_packets(
        &mut dec_tile,
        &params,
        &dest[..layer0_len],
        None,
        DecodeMode::Strict,
    )
    .unwrap();
    assert_eq!(consumed, layer0_len);

    let enc = first_codeblock(&tile);
    let dec = first_codeblock(&dec_tile);
    assert_eq!(dec.decoded_passes(), enc.layers[0].num_passes);
}

#[test]
fn test_multi_resolution_rpcl_roundtrip() {
    let params_tile = TileParams {
        x0: 0,
        y0: 0,
        x1: 128,
        y1: 128,
        num_layers: 1,
        components: vec![ComponentParams {
            num_resolutions: 3,
            cblk_w_exp: 5,
            cblk_h_exp: 5,
            precinct_exps: vec![(6, 6), (6, 6), (6, 6)],
            ..ComponentParams::default()
        }],
    };
    let mut tile = Tile::build(&params_tile).unwrap();
    // One contributing codeblock per resolution, band 0, precinct 0.
    for resno in 0..3 {
        let cblk = &mut tile.components[0].resolutions[resno].bands[0].precincts[0].codeblocks[0];
        cblk.num_bps = 4;
        cblk.passes = vec![
            CodingPass {
                rate: 5,
                distortion: 50.0,
                terminates: false,
            },
            CodingPass {
                rate: 8,
                distortion: 70.0,
                terminates: false,
            },
        ];
        cblk.data = vec![resno as u8 + 1; 8];
    }
    let params = CodingParameters {
        progression_order: ProgressionOrder::Rpcl,
        ..CodingParameters::default()
    };

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 1 << 12];
    let written = encode_packets(&mut tile, &params, &mut dest, EncodeMode::FinalPass, None, None)
        .unwrap()
        .unwrap();

    let mut dec_tile = Tile::build(&params_tile).unwrap();
    let consumed =
        decode_packets(&mut dec_tile, &params, &dest[..written], None, DecodeMode::Strict).unwrap();
    assert_eq!(consumed, written);

    for resno in 0..3 {
        let dec = &dec_tile.components[0].resolutions[resno].bands[0].precincts[0].codeblocks[0];
        assert_eq!(dec.decoded_passes(), 2, "resolution {resno}");
        let mut recovered = Vec::new();
        for seg in &dec.segments {
            recovered.extend_from_slice(&dest[seg.start..seg.start + seg.len as usize]);
        }
        assert_eq!(recovered, vec![resno as u8 + 1; 8]);
    }
}

#[test]
fn test_poc_segment_roundtrip() {
    let mut tile = Tile::build(&simple_tile_params(64, 6, 2)).unwrap();
    fill_passes(&mut tile, 0, 0, 0, 4, 3);
    let params = CodingParameters {
        num_layers: 2,
        pocs: vec![
            ProgressionChange {
                resno0: 0,
                compno0: 0,
                layno1: 1,
                resno1: 1,
                compno1: 1,
                order: ProgressionOrder::Lrcp,
            },
            ProgressionChange {
                resno0: 0,
                compno0: 0,
                layno1: 2,
                resno1: 1,
                compno1: 1,
                order: ProgressionOrder::Rlcp,
            },
        ],
        ..CodingParameters::default()
    };

    rate_allocate(&mut tile, &params, 1 << 16).unwrap();
    let mut dest = vec![0u8; 512];
    let written = encode_packets(&mut tile, &params, &mut dest, EncodeMode::FinalPass, None, None)
        .unwrap()
        .unwrap();

    let mut dec_tile = Tile::build(&simple_tile_params(64, 6, 2)).unwrap();
    let consumed =
        decode_packets(&mut dec_tile, &params, &dest[..written], None, DecodeMode::Strict).unwrap();
    assert_eq!(consumed, written);
    assert_eq!(first_codeblock(&dec_tile).decoded_passes(), 4);
}

#[test]
fn test_packed_header_source_cursor() {
    let data = [0x80u8, 0x00];
    let src = PacketHeaderSource::new(&data);
    assert_eq!(src.remaining(), 2);
}

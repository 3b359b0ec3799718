//! Packet codec (Tier-2 coding), ISO/IEC 15444-1 B.9-B.10.
//!
//! A packet carries, for one (component, resolution, precinct, layer)
//! tuple, the new coding passes of every codeblock of the precinct. The
//! header signals inclusion (tag-tree coded on first reference, one
//! direct bit afterwards), zero bit-planes on first inclusion, the
//! number of new passes (Table B.4), an Lblock increment (comma code)
//! and the codeword segment lengths; the body is the raw concatenation
//! of the announced byte ranges in the same sub-band-major, codeblock-
//! major order. Optional SOP markers precede packets in the tile-part
//! stream and optional EPH markers terminate headers; headers may be
//! redirected to a PPM/PPT side channel.

use log::{debug, trace, warn};

use crate::bit_io::{BitReader, BitWriter};
use crate::coding_parameters::{CodeblockStyle, CodingParameters, PackedHeaderMode};
use crate::constants::{
    EPH_MARKER, INITIAL_LENGTH_BITS, LAZY_FIRST_SEGMENT_PASSES, MAX_PASSES_PER_PACKET,
    MAX_SEGMENT_PASSES, SOP_MARKER, SOP_MARKER_LEN, TAG_TREE_SENTINEL,
};
use crate::error::Tier2Error;
use crate::progression::{PacketIndex, PacketIteratorFamily};
use crate::tile::{CodingPass, Segment, Tile};

/// Whether an encode run produces bytes or only probes the byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    /// Rate-allocation trial: sizes are computed, bodies are not copied.
    ThresholdCalc,
    /// The real encode.
    FinalPass,
}

/// Strictness of malformed-stream handling during decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// Every malformed-stream condition aborts the tile.
    Strict,
    /// Oversized segment lengths corrupt only the affected codeblock;
    /// marker mismatches and truncation are logged and survived.
    Lenient,
}

/// Cursor over a PPM/PPT packed-header buffer.
#[derive(Debug)]
pub struct PacketHeaderSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketHeaderSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Number of new coding passes, Table B.4.
fn put_num_passes(bw: &mut BitWriter, n: u32) -> bool {
    match n {
        1 => bw.write_bits(0, 1),
        2 => bw.write_bits(2, 2),
        3..=5 => bw.write_bits(0xC | (n - 3), 4),
        6..=36 => bw.write_bits(0x1E0 | (n - 6), 9),
        _ => bw.write_bits(0xFF80 | (n - 37), 16),
    }
}

fn get_num_passes(reader: &mut BitReader) -> Result<u32, Tier2Error> {
    if reader.read_bit()? == 0 {
        return Ok(1);
    }
    if reader.read_bit()? == 0 {
        return Ok(2);
    }
    let n = reader.read_bits(2)?;
    if n != 3 {
        return Ok(3 + n);
    }
    let n = reader.read_bits(5)?;
    if n != 31 {
        return Ok(6 + n);
    }
    Ok(37 + reader.read_bits(7)?)
}

/// Lblock increment: a run of ones terminated by a zero, B.10.7.1.
fn put_comma_code(bw: &mut BitWriter, n: u32) -> bool {
    for _ in 0..n {
        if !bw.write_bit(1) {
            return false;
        }
    }
    bw.write_bit(0)
}

fn get_comma_code(reader: &mut BitReader) -> Result<u32, Tier2Error> {
    let mut n = 0u32;
    while reader.read_bit()? == 1 {
        n += 1;
        if n > 32 {
            return Err(Tier2Error::LengthBitsOverflow);
        }
    }
    Ok(n)
}

/// Pass capacity of the next codeword segment given the previous
/// segment's capacity (0 = first segment), B.10.7.2 and Table B.4 notes.
fn segment_capacity(style: CodeblockStyle, prev_max: u32) -> u32 {
    if style.terminate_all {
        1
    } else if style.bypass {
        if prev_max == 0 {
            LAZY_FIRST_SEGMENT_PASSES
        } else if prev_max == 1 || prev_max == LAZY_FIRST_SEGMENT_PASSES {
            2
        } else {
            1
        }
    } else {
        MAX_SEGMENT_PASSES
    }
}

fn pass_len(passes: &[CodingPass], passno: usize) -> u32 {
    let prev = if passno == 0 {
        0
    } else {
        passes[passno - 1].rate
    };
    debug_assert!(passes[passno].rate >= prev, "pass rates must be cumulative");
    passes[passno].rate - prev
}

/// Encode one packet into `dest`. Returns the bytes written, or `None`
/// when the destination budget does not fit the packet; the precinct
/// signalling state is then mid-packet and the whole layer range must be
/// re-encoded (rate allocation always restarts from layer 0).
#[allow(clippy::too_many_arguments)]
pub fn encode_packet(
    tile: &mut Tile,
    params: &CodingParameters,
    idx: PacketIndex,
    dest: &mut [u8],
    packno: u32,
    mode: EncodeMode,
    mut header_sink: Option<&mut Vec<u8>>,
) -> Result<Option<usize>, Tier2Error> {
    let layno = idx.layno;
    let comp = tile
        .components
        .get_mut(idx.compno as usize)
        .ok_or(Tier2Error::InvalidOperation)?;
    let res = comp
        .resolutions
        .get_mut(idx.resno as usize)
        .ok_or(Tier2Error::InvalidOperation)?;
    if idx.precno >= res.num_precincts() {
        return Err(Tier2Error::InvalidPrecinctIndex);
    }
    let precno = idx.precno as usize;

    let mut pos = 0usize;

    if params.use_sop {
        if pos + SOP_MARKER_LEN > dest.len() {
            return Ok(None);
        }
        dest[pos..pos + 2].copy_from_slice(&SOP_MARKER);
        dest[pos + 2] = 0;
        dest[pos + 3] = 4;
        dest[pos + 4] = (packno >> 8) as u8;
        dest[pos + 5] = packno as u8;
        pos += SOP_MARKER_LEN;
    }

    // First layer of a precinct: reset the signalling state and seed the
    // zero bit-plane tree from the band/codeblock bit-plane counts.
    if layno == 0 {
        for band in res.bands.iter_mut().filter(|b| !b.is_empty()) {
            let band_bps = band.num_bps;
            let prc = &mut band.precincts[precno];
            if prc.is_empty() {
                continue;
            }
            if let Some(tree) = prc.inclusion_tree.as_mut() {
                tree.reset();
            }
            if let Some(tree) = prc.zero_bp_tree.as_mut() {
                tree.reset();
                for (cblkno, cblk) in prc.codeblocks.iter_mut().enumerate() {
                    cblk.num_passes = 0;
                    tree.set_value(cblkno, band_bps.saturating_sub(cblk.num_bps));
                }
            }
        }
    }

    let packet_empty = res.bands.iter().filter(|b| !b.is_empty()).all(|band| {
        let prc = &band.precincts[precno];
        prc.codeblocks.iter().all(|cblk| {
            cblk.layers
                .get(layno as usize)
                .is_none_or(|l| l.num_passes == 0)
        })
    });

    // Packet header.
    let header_len = {
        let mut bw = match header_sink.as_mut() {
            Some(sink) => BitWriter::packed(sink),
            None => BitWriter::bounded(&mut dest[pos..]),
        };

        if !bw.write_bit(u32::from(!packet_empty)) {
            return Ok(None);
        }

        if !packet_empty {
            for band in res.bands.iter_mut().filter(|b| !b.is_empty()) {
                let prc = &mut band.precincts[precno];
                if prc.is_empty() {
                    continue;
                }
                let incl_tree = prc
                    .inclusion_tree
                    .as_mut()
                    .ok_or(Tier2Error::InvalidOperation)?;
                let zbp_tree = prc
                    .zero_bp_tree
                    .as_mut()
                    .ok_or(Tier2Error::InvalidOperation)?;

                for (cblkno, cblk) in prc.codeblocks.iter().enumerate() {
                    let newly_included = cblk.num_passes == 0
                        && cblk
                            .layers
                            .get(layno as usize)
                            .is_some_and(|l| l.num_passes > 0);
                    if newly_included {
                        incl_tree.set_value(cblkno, layno);
                    }
                }

                for (cblkno, cblk) in prc.codeblocks.iter_mut().enumerate() {
                    let layer = cblk
                        .layers
                        .get(layno as usize)
                        .copied()
                        .unwrap_or_default();

                    // Inclusion.
                    if cblk.num_passes == 0 {
                        if !incl_tree.encode(&mut bw, cblkno, layno + 1) {
                            return Ok(None);
                        }
                    } else if !bw.write_bit(u32::from(layer.num_passes != 0)) {
                        return Ok(None);
                    }
                    if layer.num_passes == 0 {
                        continue;
                    }

                    // Zero bit-planes, first inclusion only.
                    if cblk.num_passes == 0 {
                        cblk.num_len_bits = INITIAL_LENGTH_BITS;
                        if !zbp_tree.encode(&mut bw, cblkno, TAG_TREE_SENTINEL) {
                            return Ok(None);
                        }
                    }

                    if layer.num_passes > MAX_PASSES_PER_PACKET {
                        return Err(Tier2Error::InvalidParameter);
                    }
                    if !put_num_passes(&mut bw, layer.num_passes) {
                        return Ok(None);
                    }

                    let first = cblk.num_passes as usize;
                    let last = first + layer.num_passes as usize;
                    if last > cblk.passes.len() {
                        return Err(Tier2Error::InvalidParameter);
                    }

                    // Lblock increase needed so every codeword segment
                    // length of this contribution fits its field.
                    let mut increment = 0u32;
                    let mut seg_len = 0u32;
                    let mut seg_passes = 0u32;
                    for passno in first..last {
                        seg_passes += 1;
                        seg_len += pass_len(&cblk.passes, passno);
                        if cblk.passes[passno].terminates || passno + 1 == last {
                            let needed = seg_len.max(1).ilog2() + 1;
                            let available = cblk.num_len_bits + seg_passes.ilog2();
                            increment = increment.max(needed.saturating_sub(available));
                            seg_len = 0;
                            seg_passes = 0;
                        }
                    }
                    if !put_comma_code(&mut bw, increment) {
                        return Ok(None);
                    }
                    cblk.num_len_bits += increment;

                    // Codeword segment lengths.
                    let mut seg_len = 0u32;
                    let mut seg_passes = 0u32;
                    for passno in first..last {
                        seg_passes += 1;
                        seg_len += pass_len(&cblk.passes, passno);
                        if cblk.passes[passno].terminates || passno + 1 == last {
                            let bits = cblk.num_len_bits + seg_passes.ilog2();
                            if bits > 32 {
                                return Err(Tier2Error::LengthBitsOverflow);
                            }
                            if !bw.write_bits(seg_len, bits) {
                                return Ok(None);
                            }
                            seg_len = 0;
                            seg_passes = 0;
                        }
                    }

                    cblk.num_passes += layer.num_passes;
                }
            }
        }

        if !bw.flush() {
            return Ok(None);
        }
        bw.written()
    };

    if header_sink.is_none() {
        pos += header_len;
    }

    if params.use_eph {
        match header_sink.as_mut() {
            Some(sink) => sink.extend_from_slice(&EPH_MARKER),
            None => {
                if pos + 2 > dest.len() {
                    return Ok(None);
                }
                dest[pos..pos + 2].copy_from_slice(&EPH_MARKER);
                pos += 2;
            }
        }
    }

    // Packet body: raw byte ranges in header order.
    if !packet_empty {
        for band in res.bands.iter().filter(|b| !b.is_empty()) {
            let prc = &band.precincts[precno];
            if prc.is_empty() {
                continue;
            }
            for cblk in &prc.codeblocks {
                let layer = cblk
                    .layers
                    .get(layno as usize)
                    .copied()
                    .unwrap_or_default();
                if layer.num_passes == 0 {
                    continue;
                }
                let len = layer.len as usize;
                if pos + len > dest.len() {
                    return Ok(None);
                }
                if mode == EncodeMode::FinalPass {
                    let start = layer.start as usize;
                    let end = start + len;
                    if end > cblk.data.len() {
                        return Err(Tier2Error::InvalidParameter);
                    }
                    dest[pos..pos + len].copy_from_slice(&cblk.data[start..end]);
                }
                pos += len;
            }
        }
    }

    trace!(
        "packet {packno} c={} r={} p={} l={} -> {pos} bytes{}",
        idx.compno,
        idx.resno,
        idx.precno,
        idx.layno,
        if packet_empty { " (empty)" } else { "" },
    );
    Ok(Some(pos))
}

/// Encode every packet of the tile in progression order. `max_layers`
/// restricts the encode to layers below the bound (rate-allocation
/// trials); `None` encodes all layers. Returns `None` when `dest` cannot
/// hold the packets.
pub fn encode_packets(
    tile: &mut Tile,
    params: &CodingParameters,
    dest: &mut [u8],
    mode: EncodeMode,
    max_layers: Option<u32>,
    mut packed_headers: Option<&mut Vec<u8>>,
) -> Result<Option<usize>, Tier2Error> {
    if params.packed_headers != PackedHeaderMode::Inline && packed_headers.is_none() {
        return Err(Tier2Error::InvalidParameter);
    }

    let mut family = PacketIteratorFamily::create_encode(tile, params)?;
    let mut pos = 0usize;
    let mut packno = 0u32;

    let use_sink = params.packed_headers != PackedHeaderMode::Inline;
    for segno in 0..family.num_segments() {
        while let Some(idx) = family.next(segno)? {
            if max_layers.is_some_and(|bound| idx.layno >= bound) {
                continue;
            }
            let sink = if use_sink {
                packed_headers.as_deref_mut()
            } else {
                None
            };
            match encode_packet(tile, params, idx, &mut dest[pos..], packno, mode, sink)? {
                Some(n) => {
                    pos += n;
                    packno += 1;
                }
                None => return Ok(None),
            }
        }
    }

    debug!("encoded {packno} packets, {pos} bytes");
    Ok(Some(pos))
}

/// Decode one packet at `src[*src_pos..]`, resolving codeword segment
/// chunks into the codeblocks of the addressed precinct. Header bits come
/// from `side_headers` when packed headers are in use.
#[allow(clippy::too_many_arguments)]
pub fn decode_packet(
    tile: &mut Tile,
    params: &CodingParameters,
    idx: PacketIndex,
    src: &[u8],
    src_pos: &mut usize,
    mut side_headers: Option<&mut PacketHeaderSource<'_>>,
    packno: u32,
    mode: DecodeMode,
) -> Result<(), Tier2Error> {
    let layno = idx.layno;
    let comp = tile
        .components
        .get_mut(idx.compno as usize)
        .ok_or(Tier2Error::InvalidOperation)?;
    let res = comp
        .resolutions
        .get_mut(idx.resno as usize)
        .ok_or(Tier2Error::InvalidOperation)?;
    if idx.precno >= res.num_precincts() {
        return Err(Tier2Error::InvalidPrecinctIndex);
    }
    let precno = idx.precno as usize;

    for band in res.bands.iter_mut().filter(|b| !b.is_empty()) {
        let prc = &mut band.precincts[precno];
        if prc.is_empty() {
            continue;
        }
        if layno == 0 {
            if let Some(tree) = prc.inclusion_tree.as_mut() {
                tree.reset();
            }
            if let Some(tree) = prc.zero_bp_tree.as_mut() {
                tree.reset();
            }
        }
        for cblk in prc.codeblocks.iter_mut() {
            if layno == 0 {
                cblk.included = false;
                cblk.corrupted = false;
                cblk.zero_bit_planes = 0;
                cblk.num_passes = 0;
                cblk.num_len_bits = INITIAL_LENGTH_BITS;
                cblk.cur_seg_passes = 0;
                cblk.cur_seg_max = 0;
                cblk.segments.clear();
            }
            cblk.pending_chunks.clear();
        }
    }

    if params.use_sop {
        let rest = &src[*src_pos..];
        if rest.len() >= SOP_MARKER_LEN && rest[..2] == SOP_MARKER {
            let nsop = u32::from(rest[4]) << 8 | u32::from(rest[5]);
            if nsop != (packno & 0xFFFF) {
                if mode == DecodeMode::Strict {
                    return Err(Tier2Error::InvalidSopMarker);
                }
                warn!("SOP counter {nsop} does not match packet {packno}");
            }
            *src_pos += SOP_MARKER_LEN;
        } else if mode == DecodeMode::Strict {
            return Err(Tier2Error::InvalidSopMarker);
        } else {
            warn!("missing SOP marker before packet {packno}");
        }
    }

    let (hdata, hpos): (&[u8], usize) = match &side_headers {
        Some(side) => (side.data, side.pos),
        None => (src, *src_pos),
    };

    let mut reader = BitReader::new(&hdata[hpos..]);
    let packet_empty = reader.read_bit()? == 0;

    if !packet_empty {
        for band in res.bands.iter_mut().filter(|b| !b.is_empty()) {
            let band_bps = band.num_bps;
            let prc = &mut band.precincts[precno];
            if prc.is_empty() {
                continue;
            }
            let incl_tree = prc
                .inclusion_tree
                .as_mut()
                .ok_or(Tier2Error::InvalidOperation)?;
            let zbp_tree = prc
                .zero_bp_tree
                .as_mut()
                .ok_or(Tier2Error::InvalidOperation)?;

            for (cblkno, cblk) in prc.codeblocks.iter_mut().enumerate() {
                // Inclusion, B.10.4.
                let included = if !cblk.included {
                    incl_tree.decode(&mut reader, cblkno, layno + 1)?
                } else {
                    reader.read_bit()? == 1
                };
                if !included {
                    continue;
                }

                // Zero bit-planes on first inclusion, B.10.5.
                if !cblk.included {
                    let zbp = zbp_tree.decode_value(&mut reader, cblkno)?;
                    cblk.zero_bit_planes = zbp;
                    cblk.num_bps = band_bps.saturating_sub(zbp);
                    cblk.num_len_bits = INITIAL_LENGTH_BITS;
                    cblk.included = true;
                }

                // New coding passes and Lblock increment, B.10.6-B.10.7.
                let mut remaining = get_num_passes(&mut reader)?;
                let increment = get_comma_code(&mut reader)?;
                cblk.num_len_bits += increment;
                if cblk.num_len_bits > 32 {
                    return Err(Tier2Error::LengthBitsOverflow);
                }
                cblk.num_passes += remaining;

                while remaining > 0 {
                    if cblk.cur_seg_max == 0 || cblk.cur_seg_passes == cblk.cur_seg_max {
                        cblk.cur_seg_max = segment_capacity(params.cblk_style, cblk.cur_seg_max);
                        cblk.cur_seg_passes = 0;
                    }
                    let take = (cblk.cur_seg_max - cblk.cur_seg_passes).min(remaining);
                    let bits = cblk.num_len_bits + take.ilog2();
                    if bits > 32 {
                        return Err(Tier2Error::LengthBitsOverflow);
                    }
                    let chunk_len = reader.read_bits(bits)?;
                    cblk.pending_chunks.push((take, chunk_len));
                    cblk.cur_seg_passes += take;
                    remaining -= take;
                }
            }
        }
    }

    reader.inalign()?;
    let mut consumed = reader.bytes_consumed();

    if params.use_eph {
        let rest = &hdata[hpos + consumed..];
        if rest.len() >= 2 && rest[..2] == EPH_MARKER {
            consumed += 2;
        } else if mode == DecodeMode::Strict {
            return Err(Tier2Error::InvalidEphMarker);
        } else {
            warn!("missing EPH marker after packet {packno} header");
        }
    }

    match side_headers.as_mut() {
        Some(side) => side.pos += consumed,
        None => *src_pos += consumed,
    }

    // Packet body: resolve announced chunks to byte ranges, in header
    // order. A chunk overrunning the buffer corrupts only its codeblock
    // in lenient mode; siblings keep their positions.
    for band in res.bands.iter_mut().filter(|b| !b.is_empty()) {
        let prc = &mut band.precincts[precno];
        if prc.is_empty() {
            continue;
        }
        for cblk in prc.codeblocks.iter_mut() {
            let chunks = std::mem::take(&mut cblk.pending_chunks);
            for (passes, chunk_len) in chunks {
                let len = chunk_len as usize;
                if *src_pos + len > src.len() {
                    if mode == DecodeMode::Strict {
                        return Err(Tier2Error::TruncatedPacketBody);
                    }
                    warn!(
                        "packet {packno}: segment of {len} bytes overruns the stream, \
                         marking codeblock corrupted"
                    );
                    cblk.corrupted = true;
                    *src_pos = src.len();
                    break;
                }
                if !cblk.corrupted {
                    cblk.segments.push(Segment {
                        start: *src_pos,
                        len: chunk_len,
                        num_passes: passes,
                    });
                }
                *src_pos += len;
            }
        }
    }

    trace!(
        "packet {packno} c={} r={} p={} l={} decoded{}",
        idx.compno,
        idx.resno,
        idx.precno,
        idx.layno,
        if packet_empty { " (empty)" } else { "" },
    );
    Ok(())
}

/// Decode every packet of the tile in progression order. Returns the
/// bytes consumed from `src`. A codestream truncated at a packet
/// boundary ends the tile cleanly; truncation inside a packet is fatal
/// in strict mode.
pub fn decode_packets(
    tile: &mut Tile,
    params: &CodingParameters,
    src: &[u8],
    packed_headers: Option<&[u8]>,
    mode: DecodeMode,
) -> Result<usize, Tier2Error> {
    if params.packed_headers != PackedHeaderMode::Inline && packed_headers.is_none() {
        return Err(Tier2Error::InvalidParameter);
    }

    let mut family = PacketIteratorFamily::create_decode(tile, params)?;
    let mut side = if params.packed_headers != PackedHeaderMode::Inline {
        packed_headers.map(PacketHeaderSource::new)
    } else {
        None
    };
    let mut pos = 0usize;
    let mut packno = 0u32;

    'segments: for segno in 0..family.num_segments() {
        while let Some(idx) = family.next(segno)? {
            let headers_done = match &side {
                Some(side) => side.remaining() == 0,
                None => pos >= src.len(),
            };
            if headers_done {
                break 'segments;
            }
            match decode_packet(
                tile,
                params,
                idx,
                src,
                &mut pos,
                side.as_mut(),
                packno,
                mode,
            ) {
                Ok(()) => packno += 1,
                Err(Tier2Error::UnexpectedEndOfStream) if mode == DecodeMode::Lenient => {
                    warn!("stream ended inside packet {packno}, stopping tile decode");
                    break 'segments;
                }
                Err(e) => return Err(e),
            }
        }
    }

    debug!("decoded {packno} packets, {pos} bytes");
    Ok(pos)
}

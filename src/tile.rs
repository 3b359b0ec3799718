//! Tile geometry and the per-codeblock pass model.
//!
//! The canvas partitioning here follows ISO/IEC 15444-1 B.5-B.7: a tile is
//! split per component into resolution levels, each resolution into
//! sub-bands, each sub-band into precincts, and each precinct into
//! codeblocks. The packet codec walks this hierarchy; the entropy coder
//! (external) fills in codeblock pass data on the encode side and consumes
//! resolved segments on the decode side.

use log::trace;

use crate::error::Tier2Error;
use crate::tag_tree::TagTree;

pub(crate) fn ceil_div(a: u32, b: u32) -> u32 {
    debug_assert!(b > 0);
    a.div_ceil(b)
}

pub(crate) fn ceil_div_pow2(a: u32, e: u32) -> u32 {
    ((u64::from(a) + (1u64 << e) - 1) >> e) as u32
}

pub(crate) fn floor_div_pow2(a: u32, e: u32) -> u32 {
    a >> e
}

/// Sub-band orientation within a decomposition level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubbandOrientation {
    /// Low-Low (resolution 0 only).
    #[default]
    LL,
    /// High-Low (horizontal details).
    HL,
    /// Low-High (vertical details).
    LH,
    /// High-High (diagonal details).
    HH,
}

impl SubbandOrientation {
    /// Band origin offsets (xob, yob) in the band rect formula (B-15).
    fn offsets(self) -> (u32, u32) {
        match self {
            SubbandOrientation::LL => (0, 0),
            SubbandOrientation::HL => (1, 0),
            SubbandOrientation::LH => (0, 1),
            SubbandOrientation::HH => (1, 1),
        }
    }
}

/// One entropy coding pass of a codeblock, as reported by Tier-1.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodingPass {
    /// Cumulative byte length of the codeblock data up to and including
    /// this pass.
    pub rate: u32,
    /// Cumulative distortion decrease up to and including this pass.
    pub distortion: f64,
    /// Whether the entropy coder terminated its codeword here; a
    /// terminated pass ends the current codeword segment.
    pub terminates: bool,
}

/// Contribution of one codeblock to one quality layer, fixed by rate
/// allocation before the final packet encode.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerContribution {
    pub num_passes: u32,
    /// Byte offset of this contribution within the codeblock data.
    pub start: u32,
    pub len: u32,
    pub distortion: f64,
}

/// A codeword segment chunk resolved during packet decoding: a zero-copy
/// byte range into the packet body buffer. A codeword segment that spans
/// several packets resolves to one chunk per packet, since sibling
/// codeblock data interleaves between them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    /// Absolute byte offset into the tile's packet body buffer.
    pub start: usize,
    pub len: u32,
    pub num_passes: u32,
}

/// A codeblock with its encoder pass table and decoder segment state.
#[derive(Debug, Clone, Default)]
pub struct Codeblock {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,

    /// Entropy-coded data (encode side: all passes, concatenated).
    pub data: Vec<u8>,
    /// Pass table from Tier-1 (encode side).
    pub passes: Vec<CodingPass>,
    /// Magnitude bit-planes actually coded for this block.
    pub num_bps: u32,

    /// Passes signalled in packets of previous layers.
    pub num_passes: u32,
    /// Codeword segment length indicator (Lblock), B.10.7.1.
    pub num_len_bits: u32,
    /// Passes committed to layers so far by rate allocation.
    pub num_passes_in_layers: u32,
    /// Per-layer contributions fixed by rate allocation.
    pub layers: Vec<LayerContribution>,

    /// Decode: whether the block was included in any previous packet.
    pub included: bool,
    /// Decode: lenient mode marked this block corrupted; the consumer
    /// must not trust its segments.
    pub corrupted: bool,
    /// Decode: number of missing most-significant bit-planes.
    pub zero_bit_planes: u32,
    /// Decode: resolved codeword segment chunks.
    pub segments: Vec<Segment>,
    /// Decode: passes already assigned to the open codeword segment.
    pub cur_seg_passes: u32,
    /// Decode: pass capacity of the open codeword segment (0 = none open).
    pub cur_seg_max: u32,
    /// Chunks announced by the current packet header, drained by the
    /// body phase: (passes, bytes).
    pub(crate) pending_chunks: Vec<(u32, u32)>,
}

impl Codeblock {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    /// Total passes decoded across all segments.
    pub fn decoded_passes(&self) -> u32 {
        self.segments.iter().map(|s| s.num_passes).sum()
    }
}

/// A precinct of one sub-band: a codeblock grid plus the two tag trees
/// signaling inclusion and zero bit-planes.
#[derive(Debug, Default)]
pub struct Precinct {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    /// Codeblock grid dimensions.
    pub cw: u32,
    pub ch: u32,
    pub codeblocks: Vec<Codeblock>,
    pub inclusion_tree: Option<TagTree>,
    pub zero_bp_tree: Option<TagTree>,
}

impl Precinct {
    pub fn is_empty(&self) -> bool {
        self.cw == 0 || self.ch == 0
    }
}

#[derive(Debug, Default)]
pub struct Subband {
    pub orientation: SubbandOrientation,
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    /// Maximum magnitude bit-planes for this band (from quantization).
    pub num_bps: u32,
    pub precincts: Vec<Precinct>,
}

impl Subband {
    pub fn is_empty(&self) -> bool {
        self.x0 == self.x1 || self.y0 == self.y1
    }
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    /// Precinct exponents at this resolution.
    pub pdx: u32,
    pub pdy: u32,
    /// Precinct grid dimensions.
    pub pw: u32,
    pub ph: u32,
    pub bands: Vec<Subband>,
}

impl Resolution {
    pub fn num_precincts(&self) -> u32 {
        self.pw * self.ph
    }
}

#[derive(Debug, Default)]
pub struct TileComponent {
    /// Subsampling factors on the reference grid.
    pub dx: u32,
    pub dy: u32,
    pub resolutions: Vec<Resolution>,
}

/// Per-component build parameters.
#[derive(Debug, Clone)]
pub struct ComponentParams {
    pub dx: u32,
    pub dy: u32,
    /// Resolution levels (decomposition levels + 1).
    pub num_resolutions: u32,
    /// log2 nominal codeblock dimensions.
    pub cblk_w_exp: u32,
    pub cblk_h_exp: u32,
    /// Per-resolution precinct exponents; empty means maximal precincts
    /// (2^15, one precinct covering the resolution).
    pub precinct_exps: Vec<(u32, u32)>,
    /// Magnitude bit-planes per band.
    pub band_num_bps: u32,
}

impl Default for ComponentParams {
    fn default() -> Self {
        Self {
            dx: 1,
            dy: 1,
            num_resolutions: 1,
            cblk_w_exp: 6,
            cblk_h_exp: 6,
            precinct_exps: Vec::new(),
            band_num_bps: 8,
        }
    }
}

/// Tile build parameters: the tile rect on the reference grid plus the
/// per-component coding geometry.
#[derive(Debug, Clone)]
pub struct TileParams {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    pub num_layers: u32,
    pub components: Vec<ComponentParams>,
}

/// A tile: the unit of packetization. One `Tile` plus one iterator family
/// exists per tile encode or decode invocation.
#[derive(Debug, Default)]
pub struct Tile {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
    pub num_layers: u32,
    pub components: Vec<TileComponent>,
}

impl Tile {
    /// Build the full component/resolution/band/precinct/codeblock
    /// hierarchy for one tile.
    pub fn build(params: &TileParams) -> Result<Self, Tier2Error> {
        if params.x0 >= params.x1
            || params.y0 >= params.y1
            || params.num_layers == 0
            || params.components.is_empty()
        {
            return Err(Tier2Error::InvalidParameter);
        }

        let mut components = Vec::with_capacity(params.components.len());
        for cp in &params.components {
            if cp.dx == 0 || cp.dy == 0 || cp.num_resolutions == 0 || cp.num_resolutions > 33 {
                return Err(Tier2Error::InvalidParameter);
            }
            components.push(build_component(params, cp)?);
        }

        Ok(Self {
            x0: params.x0,
            y0: params.y0,
            x1: params.x1,
            y1: params.y1,
            num_layers: params.num_layers,
            components,
        })
    }

    /// Largest precinct count over all components and resolutions.
    pub fn max_precincts(&self) -> u32 {
        self.components
            .iter()
            .flat_map(|c| c.resolutions.iter())
            .map(|r| r.num_precincts())
            .max()
            .unwrap_or(0)
    }

    /// Largest resolution count over all components.
    pub fn max_resolutions(&self) -> u32 {
        self.components
            .iter()
            .map(|c| c.resolutions.len() as u32)
            .max()
            .unwrap_or(0)
    }
}

fn build_component(params: &TileParams, cp: &ComponentParams) -> Result<TileComponent, Tier2Error> {
    // Tile-component rect (B-12).
    let tcx0 = ceil_div(params.x0, cp.dx);
    let tcy0 = ceil_div(params.y0, cp.dy);
    let tcx1 = ceil_div(params.x1, cp.dx);
    let tcy1 = ceil_div(params.y1, cp.dy);

    let num_res = cp.num_resolutions;
    let mut resolutions = Vec::with_capacity(num_res as usize);

    for resno in 0..num_res {
        let level = num_res - 1 - resno;

        // Resolution rect (B-14).
        let trx0 = ceil_div_pow2(tcx0, level);
        let try0 = ceil_div_pow2(tcy0, level);
        let trx1 = ceil_div_pow2(tcx1, level);
        let try1 = ceil_div_pow2(tcy1, level);

        let (pdx, pdy) = cp
            .precinct_exps
            .get(resno as usize)
            .copied()
            .unwrap_or((15, 15));
        if pdx == 0 && resno > 0 || pdy == 0 && resno > 0 || pdx > 15 || pdy > 15 {
            return Err(Tier2Error::InvalidParameter);
        }

        // Precinct grid (B.6): aligned to multiples of 2^pdx on the
        // resolution canvas.
        let pw = if trx0 == trx1 {
            0
        } else {
            ceil_div_pow2(trx1, pdx) - floor_div_pow2(trx0, pdx)
        };
        let ph = if try0 == try1 {
            0
        } else {
            ceil_div_pow2(try1, pdy) - floor_div_pow2(try0, pdy)
        };

        let orientations: &[SubbandOrientation] = if resno == 0 {
            &[SubbandOrientation::LL]
        } else {
            &[
                SubbandOrientation::HL,
                SubbandOrientation::LH,
                SubbandOrientation::HH,
            ]
        };

        let mut bands = Vec::with_capacity(orientations.len());
        for &orientation in orientations {
            bands.push(build_band(
                cp,
                orientation,
                resno,
                num_res,
                (tcx0, tcy0, tcx1, tcy1),
                (trx0, try0),
                (pdx, pdy),
                (pw, ph),
            ));
        }

        trace!(
            "resolution {resno}: rect [{trx0},{try0} {}x{}], precincts {pw}x{ph}",
            trx1 - trx0,
            try1 - try0,
        );

        resolutions.push(Resolution {
            x0: trx0,
            y0: try0,
            x1: trx1,
            y1: try1,
            pdx,
            pdy,
            pw,
            ph,
            bands,
        });
    }

    Ok(TileComponent {
        dx: cp.dx,
        dy: cp.dy,
        resolutions,
    })
}

#[allow(clippy::too_many_arguments)]
fn build_band(
    cp: &ComponentParams,
    orientation: SubbandOrientation,
    resno: u32,
    num_res: u32,
    (tcx0, tcy0, tcx1, tcy1): (u32, u32, u32, u32),
    (trx0, try0): (u32, u32),
    (pdx, pdy): (u32, u32),
    (pw, ph): (u32, u32),
) -> Subband {
    // Band rect (B-15). The numerator can go negative for origin-0
    // tiles, but the quotient never does.
    let (bx0, by0, bx1, by1) = if resno == 0 {
        let level = num_res - 1;
        (
            ceil_div_pow2(tcx0, level),
            ceil_div_pow2(tcy0, level),
            ceil_div_pow2(tcx1, level),
            ceil_div_pow2(tcy1, level),
        )
    } else {
        let nb = num_res - resno;
        let (xob, yob) = orientation.offsets();
        let shift = |v: u32, ob: u32| -> u32 {
            let num = i64::from(v) - (i64::from(ob) << (nb - 1));
            let d = 1i64 << nb;
            (num.div_euclid(d) + i64::from(num.rem_euclid(d) != 0)) as u32
        };
        (
            shift(tcx0, xob),
            shift(tcy0, yob),
            shift(tcx1, xob),
            shift(tcy1, yob),
        )
    };

    // Precinct partition mapped into band coordinates: one level shift
    // for resolutions above zero.
    let (bpx, bpy, prc_x_start, prc_y_start) = if resno == 0 {
        (
            pdx,
            pdy,
            floor_div_pow2(trx0, pdx) << pdx,
            floor_div_pow2(try0, pdy) << pdy,
        )
    } else {
        (
            pdx - 1,
            pdy - 1,
            (floor_div_pow2(trx0, pdx) << pdx) / 2,
            (floor_div_pow2(try0, pdy) << pdy) / 2,
        )
    };

    // Codeblocks never exceed the precinct (B.7).
    let cbw_exp = cp.cblk_w_exp.min(bpx);
    let cbh_exp = cp.cblk_h_exp.min(bpy);
    let cbw = 1u32 << cbw_exp;
    let cbh = 1u32 << cbh_exp;

    let mut precincts = Vec::with_capacity((pw * ph) as usize);
    for j in 0..ph {
        for i in 0..pw {
            let px0 = prc_x_start + (i << bpx);
            let py0 = prc_y_start + (j << bpy);
            let px1 = px0 + (1 << bpx);
            let py1 = py0 + (1 << bpy);

            // Codeblock area: precinct clipped to the band, aligned down
            // to the codeblock grid.
            let ax0 = px0.max(bx0);
            let ay0 = py0.max(by0);
            let ax1 = px1.min(bx1);
            let ay1 = py1.min(by1);

            let (cw, ch, gx0, gy0) = if ax0 >= ax1 || ay0 >= ay1 {
                (0, 0, 0, 0)
            } else {
                let gx0 = (ax0 / cbw) * cbw;
                let gy0 = (ay0 / cbh) * cbh;
                (
                    ceil_div(ax1 - gx0, cbw),
                    ceil_div(ay1 - gy0, cbh),
                    gx0,
                    gy0,
                )
            };

            let mut codeblocks = Vec::with_capacity((cw * ch) as usize);
            for cy in 0..ch {
                for cx in 0..cw {
                    let cbx0 = (gx0 + cx * cbw).max(ax0);
                    let cby0 = (gy0 + cy * cbh).max(ay0);
                    let cbx1 = (gx0 + (cx + 1) * cbw).min(ax1);
                    let cby1 = (gy0 + (cy + 1) * cbh).min(ay1);
                    codeblocks.push(Codeblock {
                        x0: cbx0,
                        y0: cby0,
                        x1: cbx1,
                        y1: cby1,
                        ..Codeblock::default()
                    });
                }
            }

            precincts.push(Precinct {
                x0: px0,
                y0: py0,
                x1: px1,
                y1: py1,
                cw,
                ch,
                codeblocks,
                inclusion_tree: TagTree::new(cw as usize, ch as usize),
                zero_bp_tree: TagTree::new(cw as usize, ch as usize),
            });
        }
    }

    Subband {
        orientation,
        x0: bx0,
        y0: by0,
        x1: bx1,
        y1: by1,
        num_bps: cp.band_num_bps,
        precincts,
    }
}

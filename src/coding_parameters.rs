//! Coding-style parameters consumed by the packet layer.
//!
//! These mirror the fields of the COD/POC marker segments that matter to
//! Tier-2: progression order, layer count and targets, SOP/EPH use,
//! codeblock segmentation style, and packed-header mode. The surrounding
//! codestream parser owns marker syntax; this layer only consumes the
//! decoded values.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::Tier2Error;

/// Packet progression order (SGcod/SPcoc order byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProgressionOrder {
    /// Layer -> resolution -> component -> precinct.
    #[default]
    Lrcp = 0,
    /// Resolution -> layer -> component -> precinct.
    Rlcp = 1,
    /// Resolution -> precinct position -> component -> layer.
    Rpcl = 2,
    /// Precinct position -> component -> resolution -> layer.
    Pcrl = 3,
    /// Component -> precinct position -> resolution -> layer.
    Cprl = 4,
}

impl ProgressionOrder {
    /// Decode the order byte of a COD/POC segment.
    pub fn from_marker_byte(v: u8) -> Result<Self, Tier2Error> {
        Self::try_from(v).map_err(|_| Tier2Error::InvalidProgressionOrder)
    }
}

/// One progression order change record (POC marker segment entry).
///
/// Layer and precinct lower bounds are implicitly zero; the upper bounds
/// are clamped to the tile geometry when the iterator family is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressionChange {
    pub resno0: u32,
    pub compno0: u32,
    pub layno1: u32,
    pub resno1: u32,
    pub compno1: u32,
    pub order: ProgressionOrder,
}

/// Codeblock segmentation style (SPcod style byte, bits 0 and 2).
///
/// Determines the maximum pass capacity of codeword segments:
/// `terminate_all` caps every segment at one pass, `bypass` (the LAZY
/// mode) gives 10 passes to the first segment then alternates 2 and 1,
/// and the default allows 109.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeblockStyle {
    /// Selective arithmetic coding bypass (LAZY).
    pub bypass: bool,
    /// Termination on each coding pass (TERMALL).
    pub terminate_all: bool,
}

impl CodeblockStyle {
    const BYPASS_BIT: u8 = 0x01;
    const TERMALL_BIT: u8 = 0x04;

    pub fn from_marker_byte(v: u8) -> Self {
        Self {
            bypass: v & Self::BYPASS_BIT != 0,
            terminate_all: v & Self::TERMALL_BIT != 0,
        }
    }
}

/// Where packet headers are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackedHeaderMode {
    /// Headers interleaved with bodies in the tile-part stream.
    #[default]
    Inline,
    /// Headers collected in PPM marker segments (codestream scope).
    Main,
    /// Headers collected in PPT marker segments (tile scope).
    Tile,
}

/// Tier-2 coding parameters for one tile.
#[derive(Debug, Clone)]
pub struct CodingParameters {
    pub progression_order: ProgressionOrder,
    /// Number of quality layers (at least 1).
    pub num_layers: u32,
    /// Cumulative byte budget for packets of layers `0..=l`; `0.0` leaves
    /// the layer unconstrained.
    pub layer_rates: Vec<f64>,
    /// Fraction of the tile's total distortion decrease that layers
    /// `0..=l` must achieve; used when `fixed_quality` is set.
    pub layer_distortion_ratios: Vec<f64>,
    /// Allocate by distortion targets instead of byte budgets.
    pub fixed_quality: bool,
    /// Emit/expect SOP markers before each packet.
    pub use_sop: bool,
    /// Emit/expect an EPH marker after each packet header.
    pub use_eph: bool,
    pub cblk_style: CodeblockStyle,
    /// Progression order changes; empty means a single segment with
    /// `progression_order` over the whole tile.
    pub pocs: Vec<ProgressionChange>,
    pub packed_headers: PackedHeaderMode,
}

impl Default for CodingParameters {
    fn default() -> Self {
        Self {
            progression_order: ProgressionOrder::Lrcp,
            num_layers: 1,
            layer_rates: Vec::new(),
            layer_distortion_ratios: Vec::new(),
            fixed_quality: false,
            use_sop: false,
            use_eph: false,
            cblk_style: CodeblockStyle::default(),
            pocs: Vec::new(),
            packed_headers: PackedHeaderMode::Inline,
        }
    }
}

impl CodingParameters {
    pub fn validate(&self) -> Result<(), Tier2Error> {
        if self.num_layers == 0 {
            return Err(Tier2Error::InvalidParameter);
        }
        for poc in &self.pocs {
            if poc.compno0 >= poc.compno1 || poc.resno0 >= poc.resno1 || poc.layno1 == 0 {
                return Err(Tier2Error::InvalidProgressionBounds);
            }
        }
        Ok(())
    }
}

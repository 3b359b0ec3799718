//! Constants shared across the Tier-2 packet layer.

/// SOP (start of packet) marker, ISO/IEC 15444-1 A.8.1.
pub const SOP_MARKER: [u8; 2] = [0xFF, 0x91];

/// EPH (end of packet header) marker, ISO/IEC 15444-1 A.8.2.
pub const EPH_MARKER: [u8; 2] = [0xFF, 0x92];

/// Total length of an SOP marker segment: marker + Lsop + Nsop.
pub const SOP_MARKER_LEN: usize = 6;

/// Unresolved tag-tree node value; above any layer count or bit-plane
/// count the standard can express.
pub const TAG_TREE_SENTINEL: u32 = 999;

/// Initial number of bits for codeword segment lengths (Lblock), B.10.7.1.
pub const INITIAL_LENGTH_BITS: u32 = 3;

/// Maximum coding passes a single codeword segment may hold when neither
/// TERMALL nor LAZY is in effect (Table B.4 signals at most 164 passes,
/// of which up to 109 fit one segment).
pub const MAX_SEGMENT_PASSES: u32 = 109;

/// Passes in the first codeword segment under the LAZY (selective bypass)
/// style: the ten pre-bypass passes.
pub const LAZY_FIRST_SEGMENT_PASSES: u32 = 10;

/// Largest pass count Table B.4 can signal for one packet.
pub const MAX_PASSES_PER_PACKET: u32 = 164;

/// Bisection iteration cap for the per-layer slope threshold search.
pub const RATE_BISECTION_ITERATIONS: u32 = 128;

/// Relative threshold change below which the bisection has converged.
pub const RATE_BISECTION_EPSILON: f64 = 0.5e-5;

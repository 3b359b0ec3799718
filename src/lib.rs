//! JPEG 2000 Tier-2 packet layer (ISO/IEC 15444-1, Annex B).
//!
//! This crate serializes per-codeblock entropy-coded truncation points
//! into the standard's packet structure and deserializes packets back
//! into per-codeblock pass data. It is divided into several modules:
//!
//! - `bit_io`: bit-level header cursors with marker-avoidance stuffing.
//! - `tag_tree`: tag trees for inclusion and zero bit-plane signaling.
//! - `tile`: tile/resolution/sub-band/precinct/codeblock geometry and
//!   the codeblock pass model exchanged with the entropy coder.
//! - `progression`: resumable packet iterators for the five progression
//!   orders, with POC segments and tile-part support.
//! - `packet`: packet header/body codec, SOP/EPH markers, PPM/PPT
//!   packed headers, and the per-tile drivers.
//! - `rate_control`: per-layer slope-threshold rate allocation driven by
//!   trial packet encodes.
//!
//! The wavelet transform, the MQ/HT block entropy coders, and codestream
//! marker parsing live outside this crate; packet bodies are exchanged
//! as opaque byte ranges.

pub mod bit_io;
pub mod coding_parameters;
pub mod constants;
pub mod error;
pub mod packet;
pub mod progression;
pub mod rate_control;
pub mod tag_tree;
pub mod tile;

pub use coding_parameters::{
    CodeblockStyle, CodingParameters, PackedHeaderMode, ProgressionChange, ProgressionOrder,
};
pub use error::Tier2Error;

use thiserror::Error;

/// Errors raised by the Tier-2 packet layer.
///
/// Malformed-stream conditions abort the current tile decode; logic errors
/// indicate an upstream geometry computation fault rather than bad data.
/// Running out of destination budget during encoding is *not* represented
/// here: rate allocation probes that condition constantly, so the encode
/// entry points report it as an `Ok(None)` outcome instead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier2Error {
    #[error("Unexpected end of stream")]
    UnexpectedEndOfStream = 1,
    #[error("Invalid progression order")]
    InvalidProgressionOrder = 2,
    #[error("Progression bounds exceed tile geometry")]
    InvalidProgressionBounds = 3,
    #[error("Invalid precinct index")]
    InvalidPrecinctIndex = 4,
    #[error("Segment length field exceeds 32 bits")]
    LengthBitsOverflow = 5,
    #[error("Start-of-packet marker missing or garbled")]
    InvalidSopMarker = 6,
    #[error("End-of-packet-header marker missing or garbled")]
    InvalidEphMarker = 7,
    #[error("Truncated packet body")]
    TruncatedPacketBody = 8,
    #[error("Malformed packet header")]
    MalformedPacketHeader = 9,
    #[error("Invalid coding parameter")]
    InvalidParameter = 10,

    // Logic errors
    #[error("Packet sequence index out of range")]
    InclusionIndexOutOfRange = 100,
    #[error("Invalid operation")]
    InvalidOperation = 101,
}

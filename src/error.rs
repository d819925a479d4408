// Author: Lukas Bower
// Purpose: Error types surfaced by the scatter/gather engine.

//! Engine error types.

use thiserror::Error;

/// Failure reported by the DMA mapping collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// Buffer spans more segments than one work request can describe.
    #[error("buffer needs {needed} segments, limit {limit}")]
    TooManySegments {
        /// Segments the buffer would need.
        needed: usize,
        /// Segments a work request can carry.
        limit: usize,
    },
    /// Mapping resources are exhausted.
    #[error("no mapping resources available")]
    Exhausted,
    /// Mapper refused the request.
    #[error("mapping rejected: {0}")]
    Rejected(&'static str),
}

/// Why a request was rejected before reaching the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MalformedReason {
    /// Packet carries no payload.
    #[error("empty packet")]
    EmptyPacket,
    /// Segmentation offload headers shorter than the minimum.
    #[error("lso headers below minimum length")]
    LsoHeaderTooShort,
    /// Segmentation offload headers straddle the first DMA segment.
    #[error("lso headers do not survive pullup")]
    LsoHeaderSplit,
    /// Segmentation offload on a frame that is neither IPv4 nor IPv6.
    #[error("lso ethertype unsupported")]
    LsoUnsupportedEtherType,
    /// Segmentation offload on a non-TCP payload.
    #[error("lso payload is not tcp")]
    LsoNotTcp,
    /// IP or TCP header length field is out of range.
    #[error("lso header length field invalid")]
    LsoBadHeaderLength,
    /// Segmentation offload requested with a zero MSS.
    #[error("lso mss is zero")]
    LsoZeroMss,
    /// Control request larger than one descriptor.
    #[error("control request exceeds one descriptor")]
    ControlOversized,
    /// Offload work-request prefix is not a whole number of flits.
    #[error("offload prefix is not flit aligned")]
    OffloadHeaderUnaligned,
    /// Offload work request exceeds the descriptor budget.
    #[error("offload request exceeds descriptor budget")]
    OffloadOversized,
}

/// Per-packet send failure. The packet is dropped and counted; the queue is
/// unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// Request failed validation.
    #[error("malformed request: {0}")]
    Malformed(MalformedReason),
    /// Payload could not be mapped for DMA.
    #[error("dma mapping failed: {0}")]
    Mapping(#[from] MapError),
}

/// Configuration load or validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration text is not valid TOML for [`crate::config::SgeConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A numeric field is outside its accepted range.
    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        /// Offending field.
        field: &'static str,
        /// Supplied value.
        value: u64,
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
    },
    /// Fields are individually valid but inconsistent.
    #[error("{0}")]
    Inconsistent(&'static str),
}

/// Queue-set construction failure. Everything acquired before the failure
/// has been released when this is returned.
#[derive(Debug, Error)]
pub enum QsetError {
    /// Configuration rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Descriptor ring memory could not be mapped.
    #[error("failed to map {ring} ring: {source}")]
    RingMapping {
        /// Ring label.
        ring: &'static str,
        /// Mapper failure.
        source: MapError,
    },
    /// A free list could not be given a single buffer.
    #[error("free list {index} could not be populated")]
    FreeListEmpty {
        /// Free-list index.
        index: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_reason_renders_through_send_error() {
        let err = SendError::Malformed(MalformedReason::LsoHeaderSplit);
        assert_eq!(err.to_string(), "malformed request: lso headers do not survive pullup");
        assert_eq!(
            MalformedReason::ControlOversized.to_string(),
            "control request exceeds one descriptor"
        );
    }
}

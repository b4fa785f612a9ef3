//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than the structure being read
    #[error("incomplete message: need {needed} bytes, have {available}")]
    Incomplete {
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// Header length field is not 0x06
    #[error("invalid header length: {0:#04x}")]
    HeaderLength(u8),

    /// Unsupported protocol version
    #[error("version unsupported: {0:#04x}")]
    Version(u8),

    /// Unknown or unsupported service type
    #[error("unknown service type {0:#06x}")]
    Service(u16),

    /// Total length in the header disagrees with the datagram
    #[error("length mismatch: header says {declared}, datagram has {actual}")]
    Length {
        /// Length declared in the header
        declared: usize,
        /// Actual datagram length
        actual: usize,
    },

    /// Structure length byte (HPAI, CRI, connection header) is wrong
    #[error("invalid {structure} length: {length}")]
    StructureLength {
        /// Name of the structure
        structure: &'static str,
        /// Length found on the wire
        length: u8,
    },

    /// Unknown host protocol code in an HPAI
    #[error("unknown host protocol {0:#04x}")]
    HostProtocol(u8),

    /// Unknown tunnelling layer
    #[error("unknown tunnelling layer {0:#04x}")]
    Layer(u8),

    /// Encoded message would exceed the maximum message size
    #[error("size limit exceeded: {0}")]
    Size(usize),
}

#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::too_many_lines)]

mod fmt;

mod address;
pub mod audio;
mod client;
pub mod constants;
pub mod events;
pub mod group;
pub mod presentation_delay;
pub mod procedure;
pub mod processor;
pub mod store;
#[cfg(test)]
mod testing;
pub mod transport;

use crate::constants::{DEFAULT_GATE_TIMEOUT_MS, DEFAULT_LOCK_TIMEOUT_MS};
use embassy_time::Duration;

pub use address::PeerAddress;
pub use audio::{AudioContexts, CodecConfig};
pub use client::{UnicastClient, WorkItem};
pub use events::SessionEvent;
pub use group::Packing;
pub use transport::{TransportError, TransportEvent, UnicastTransport};

/// Identity of one group generation
pub type GroupId = u8;

/// Local stream-control handle, owned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamRef(pub u16);

/// Remote audio stream endpoint handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointHandle(pub u16);

/// Audio direction, seen from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Peer renders audio (host transmits)
    Sink,
    /// Peer captures audio (host receives)
    Source,
}

/// Unicast session errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UnicastError {
    /// Lookup by identity, stream or index failed
    NotFound,
    /// Duplicate registration of a peer identity or stream handle
    AlreadyExists,
    /// A bounded table is full
    CapacityExceeded,
    /// The store lock was not acquired within its budget
    LockTimeout,
    /// The procedure gate was not acquired within its budget
    GateTimeout,
    /// Internal state contradicts an invariant the session maintains
    PreconditionViolated,
    /// Streams still hold transport resources
    SessionActive,
    /// Dense iteration requested over a table with gaps
    NonDense,
    /// No presentation delay satisfies the stream
    NoValidDelay,
    /// Committed presentation delays span more than one group
    MultiGroupConflict,
    /// Channel-location or codec negotiation produced no usable configuration
    NoValidConfig,
    /// No configured stream qualifies for a start
    NothingToStart,
    /// Malformed input
    InvalidParameter,
    /// The transport already has a procedure in flight
    TransportBusy,
    /// Opaque transport failure
    TransportError(i32),
}

/// Report a broken internal invariant
///
/// Panics in debug builds; release builds hand the error to the caller.
#[track_caller]
pub(crate) fn precondition_violated(context: &'static str) -> UnicastError {
    debug_assert!(false, "precondition violated: {}", context);
    UnicastError::PreconditionViolated
}

impl From<TransportError> for UnicastError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Busy => Self::TransportBusy,
            TransportError::Code(code) => Self::TransportError(code),
        }
    }
}

/// Options for configuring a `UnicastClient`
///
/// # Examples
///
/// ```rust
/// use cisbird::{CodecConfig, Packing, UnicastOptions};
///
/// let options = UnicastOptions {
///     packing: Packing::Interleaved,
///     sink_preset: CodecConfig::lc3_24_2_1(),
///     bidirectional: true,
///     ..UnicastOptions::default()
/// };
/// assert!(options.bidirectional);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct UnicastOptions {
    /// Budget for acquiring the session store lock
    pub lock_timeout: Duration,
    /// Budget for acquiring the procedure gate on stop and update
    pub gate_timeout: Duration,
    /// CIS packing for group creation
    pub packing: Packing,
    /// Codec configuration applied to peer sink endpoints
    pub sink_preset: CodecConfig,
    /// Codec configuration applied to peer source endpoints
    pub source_preset: CodecConfig,
    /// Discover peer sources once sink discovery completes
    pub bidirectional: bool,
    /// Context advertised in stream metadata on start
    pub context: AudioContexts,
}

impl Default for UnicastOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            gate_timeout: Duration::from_millis(DEFAULT_GATE_TIMEOUT_MS),
            packing: Packing::Sequential,
            sink_preset: CodecConfig::lc3_48_4_1(),
            source_preset: CodecConfig::lc3_16_2_1(),
            bidirectional: false,
            context: AudioContexts::MEDIA,
        }
    }
}

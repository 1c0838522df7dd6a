//! Transport Interface
//!
//! The BLE Audio transport (GATT discovery, ASCS control point, ISO channels)
//! is an external collaborator. This module defines the narrow surface the
//! session engine drives, and the events the transport reports back.
//!
//! ## Calls
//!
//! Calls submit work and return once the transport accepted or rejected it.
//! Outcomes arrive later as [`TransportEvent`]s delivered through
//! [`crate::UnicastClient::notify`]. Callback contexts never block: they only
//! enqueue events.
//!
//! ## Procedures
//!
//! `start`, `stop` and `update_metadata` are group-wide procedures. The
//! transport runs at most one at a time and reports `Busy` otherwise; each
//! accepted procedure ends with exactly one completion event.

use crate::{
    Direction, EndpointHandle, PeerAddress, StreamRef,
    audio::{AudioContexts, AudioLocation, CodecCapability, CodecConfig, QosPreference},
    group::GroupParams,
    store::CoordinatedSet,
};
use bt_hci::param::{BdAddr, ConnHandle};

/// Failure reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Another procedure is in flight
    Busy,
    /// Transport-specific error code
    Code(i32),
}

/// Operations consumed from the BLE Audio transport
#[allow(async_fn_in_trait)]
pub trait UnicastTransport {
    /// Start endpoint and capability discovery for one direction of a peer
    async fn discover(&self, peer: PeerAddress, direction: Direction) -> Result<(), TransportError>;

    /// Apply a codec configuration to a remote endpoint through a local stream
    async fn configure_codec(
        &self,
        stream: StreamRef,
        endpoint: EndpointHandle,
        config: &CodecConfig,
    ) -> Result<(), TransportError>;

    /// Create the isochronous group
    async fn create_group(&self, params: &GroupParams<'_>) -> Result<(), TransportError>;

    /// Delete the isochronous group
    async fn delete_group(&self) -> Result<(), TransportError>;

    /// Configure QoS, enable and start the given streams
    async fn start(
        &self,
        streams: &[StreamRef],
        contexts: AudioContexts,
    ) -> Result<(), TransportError>;

    /// Disable and stop the given streams, releasing them when `release` is set
    async fn stop(&self, streams: &[StreamRef], release: bool) -> Result<(), TransportError>;

    /// Update the context metadata of the given streams
    async fn update_metadata(
        &self,
        streams: &[StreamRef],
        contexts: AudioContexts,
    ) -> Result<(), TransportError>;

    /// Send one SDU on a streaming stream
    async fn send(&self, stream: StreamRef, payload: &[u8]) -> Result<(), TransportError>;
}

/// Callbacks reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportEvent {
    /// ACL link to a peer established
    Connected {
        /// Peer identity
        peer: PeerAddress,
        /// Connection handle
        handle: ConnHandle,
    },
    /// ACL link to a peer lost
    Disconnected {
        /// Peer identity
        peer: PeerAddress,
    },
    /// Peer reported its audio locations for a direction
    Location {
        /// Peer identity
        peer: PeerAddress,
        /// Direction the locations apply to
        direction: Direction,
        /// Location bitmask
        locations: AudioLocation,
    },
    /// Peer reported its available contexts
    AvailableContext {
        /// Peer identity
        peer: PeerAddress,
        /// Sink contexts
        sink: AudioContexts,
        /// Source contexts
        source: AudioContexts,
    },
    /// Peer advertised a codec capability
    CodecCapability {
        /// Peer identity
        peer: PeerAddress,
        /// Direction of the capability
        direction: Direction,
        /// Capability record
        capability: CodecCapability,
    },
    /// Remote endpoint discovered, bound to a local stream
    Endpoint {
        /// Peer identity
        peer: PeerAddress,
        /// Direction of the endpoint
        direction: Direction,
        /// Remote endpoint
        endpoint: EndpointHandle,
        /// Local stream allocated for it
        stream: StreamRef,
    },
    /// Discovery for a direction finished
    DiscoverComplete {
        /// Peer identity
        peer: PeerAddress,
        /// Direction discovered
        direction: Direction,
        /// Outcome
        result: Result<(), TransportError>,
    },
    /// Peer is a member of a coordinated set
    CoordinatedSet {
        /// Peer identity
        peer: PeerAddress,
        /// Set descriptor
        set: CoordinatedSet,
    },
    /// Codec configuration applied; the peer's QoS preference is attached
    Configured {
        /// Stream configured
        stream: StreamRef,
        /// Peer QoS preference
        qos: QosPreference,
    },
    /// QoS configured
    QosSet {
        /// Stream
        stream: StreamRef,
    },
    /// Stream enabled
    Enabled {
        /// Stream
        stream: StreamRef,
    },
    /// Stream started
    Started {
        /// Stream
        stream: StreamRef,
    },
    /// Stream metadata updated
    MetadataUpdated {
        /// Stream
        stream: StreamRef,
    },
    /// Stream disabled
    Disabled {
        /// Stream
        stream: StreamRef,
    },
    /// Stream stopped
    Stopped {
        /// Stream
        stream: StreamRef,
        /// HCI reason code
        reason: u8,
    },
    /// Stream released
    Released {
        /// Stream
        stream: StreamRef,
    },
    /// Start procedure finished
    StartComplete {
        /// Outcome
        result: Result<(), TransportError>,
    },
    /// Stop procedure finished
    StopComplete {
        /// Outcome
        result: Result<(), TransportError>,
    },
    /// Update procedure finished
    UpdateComplete {
        /// Outcome
        result: Result<(), TransportError>,
    },
}

impl TransportEvent {
    /// `Connected` event from the fields of an HCI LE connection complete event
    #[must_use]
    pub fn connected(peer_addr: &BdAddr, handle: ConnHandle) -> Self {
        Self::Connected {
            peer: PeerAddress::from(peer_addr),
            handle,
        }
    }
}

//! Event Publisher
//!
//! Translates stream and discovery transitions into the small set of session
//! events the host application consumes, and delivers them on one channel.

use crate::{
    Direction, PeerAddress, StreamRef, constants::SESSION_EVENT_DEPTH, store::CoordinatedSet,
};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};

/// Outward session events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionEvent {
    /// A stream started streaming
    Streaming {
        /// Owning peer
        peer: PeerAddress,
        /// Direction of the stream
        direction: Direction,
        /// Stream
        stream: StreamRef,
    },
    /// No stream of any peer is streaming any more
    NotStreaming,
    /// A stream finished codec configuration
    ConfigReceived {
        /// Owning peer
        peer: PeerAddress,
        /// Direction of the stream
        direction: Direction,
        /// Stream
        stream: StreamRef,
    },
    /// Negotiation for a peer direction produced nothing usable
    NoValidConfig {
        /// Peer
        peer: PeerAddress,
        /// Direction
        direction: Direction,
    },
    /// A peer turned out to be a coordinated set member
    CoordinatedSetDiscovered {
        /// Peer
        peer: PeerAddress,
        /// Set descriptor
        set: CoordinatedSet,
    },
}

/// Stream lifecycle notifications relevant to the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamNotification {
    /// Codec configured
    Configured,
    /// Started
    Started,
    /// Stopped
    Stopped,
    /// Released
    Released,
}

/// Map a stream notification onto the event to publish.
///
/// `streaming_remaining` is the number of streams still streaming across the
/// whole store after the transition was applied; `NotStreaming` is only
/// produced when it is zero.
#[must_use]
pub fn translate(
    notification: StreamNotification,
    peer: PeerAddress,
    direction: Direction,
    stream: StreamRef,
    streaming_remaining: usize,
) -> Option<SessionEvent> {
    match notification {
        StreamNotification::Configured => Some(SessionEvent::ConfigReceived {
            peer,
            direction,
            stream,
        }),
        StreamNotification::Started => Some(SessionEvent::Streaming {
            peer,
            direction,
            stream,
        }),
        StreamNotification::Stopped | StreamNotification::Released => {
            (streaming_remaining == 0).then_some(SessionEvent::NotStreaming)
        }
    }
}

/// Channel delivering session events to the application
pub struct EventPublisher {
    channel: Channel<CriticalSectionRawMutex, SessionEvent, SESSION_EVENT_DEPTH>,
}

impl EventPublisher {
    /// Create an empty publisher
    #[must_use]
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
        }
    }

    /// Publish without blocking; a full channel drops the event
    pub fn publish(&self, event: SessionEvent) {
        debug!("[EVENT] {:?}", event);
        if self.channel.try_send(event).is_err() {
            warn!("[EVENT] Session event channel full, dropping {:?}", event);
        }
    }

    /// Wait for the next session event
    pub async fn receive(&self) -> SessionEvent {
        self.channel.receive().await
    }

    /// Next session event, if one is queued
    pub fn try_receive(&self) -> Option<SessionEvent> {
        self.channel.try_receive().ok()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

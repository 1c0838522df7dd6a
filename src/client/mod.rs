//! Unicast Client - session orchestration
//!
//! `UnicastClient` is the explicit context a session runs in. It owns the
//! session store, the procedure gate, the inbound transport-event queue, the
//! serialized work queue and the event publisher. One instance is created at
//! session start and shared by reference between the processor task and
//! application callers.
//!
//! ## Event Flow
//!
//! 1. Transport callbacks call [`UnicastClient::notify`], which only enqueues
//! 2. The processor task ([`crate::processor::run`]) drains the queue and
//!    applies each event as a state transition under the store lock
//! 3. Group (re)build work produced by those transitions goes to the work
//!    queue and runs one item at a time, in submission order
//! 4. Results reach the application as [`SessionEvent`]s
//!
//! ## Application API
//!
//! `discover_peer`, `start_session`, `stop_session`, `update_context`,
//! `send_audio` and `get_config` are called from application tasks. They take
//! the same store lock as the processor, with the configured timeout.

mod discovery;
mod procedures;
mod streams;

use crate::{
    Direction, StreamRef, TransportEvent, UnicastError, UnicastOptions, UnicastTransport,
    audio::{AudioContexts, AudioFrame, AudioLocation, CodecConfig},
    constants::{EVENT_QUEUE_DEPTH, MAX_GROUP_MEMBERS, MAX_SDU_LENGTH, WORK_QUEUE_DEPTH},
    events::{EventPublisher, SessionEvent},
    procedure::ProcedureGate,
    store::{SessionStore, StoreGuard, StreamState},
};
use core::cell::Cell;
use embassy_sync::{
    blocking_mutex::{Mutex, raw::CriticalSectionRawMutex},
    channel::Channel,
};
use heapless::Vec;

/// Deferred work executed on the serialized work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WorkItem {
    /// Re-run the start procedure after the gate was released
    RetryStart,
    /// Delete and rebuild the group once every member is idle
    RebuildGroup,
}

/// LE Audio unicast session context
pub struct UnicastClient<T: UnicastTransport> {
    transport: T,
    options: UnicastOptions,
    store: SessionStore,
    gate: ProcedureGate,
    events: EventPublisher,
    context: Mutex<CriticalSectionRawMutex, Cell<AudioContexts>>,
    inbox: Channel<CriticalSectionRawMutex, TransportEvent, EVENT_QUEUE_DEPTH>,
    work: Channel<CriticalSectionRawMutex, WorkItem, WORK_QUEUE_DEPTH>,
}

impl<T: UnicastTransport> UnicastClient<T> {
    /// Create a session context driving `transport`
    #[must_use]
    pub fn new(transport: T, options: UnicastOptions) -> Self {
        Self {
            transport,
            options,
            store: SessionStore::new(),
            gate: ProcedureGate::new(),
            events: EventPublisher::new(),
            context: Mutex::new(Cell::new(options.context)),
            inbox: Channel::new(),
            work: Channel::new(),
        }
    }

    /// Options the session was created with
    #[must_use]
    pub fn options(&self) -> &UnicastOptions {
        &self.options
    }

    /// The driven transport
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The session store
    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// The procedure gate
    #[must_use]
    pub fn gate(&self) -> &ProcedureGate {
        &self.gate
    }

    /// Context advertised on the next start
    #[must_use]
    pub fn context(&self) -> AudioContexts {
        self.context.lock(Cell::get)
    }

    pub(crate) fn set_context(&self, contexts: AudioContexts) {
        self.context.lock(|cell| cell.set(contexts));
    }

    pub(crate) async fn lock(&self) -> Result<StoreGuard<'_>, UnicastError> {
        self.store.lock(self.options.lock_timeout).await
    }

    /// Hand a transport callback to the session without blocking
    ///
    /// # Errors
    /// Returns `UnicastError::CapacityExceeded` if the inbound queue is full.
    pub fn notify(&self, event: TransportEvent) -> Result<(), UnicastError> {
        self.inbox.try_send(event).map_err(|_| {
            error!("[CLIENT] Transport event queue full, dropping {:?}", event);
            UnicastError::CapacityExceeded
        })
    }

    /// Wait for the next queued transport event
    pub async fn next_transport_event(&self) -> TransportEvent {
        self.inbox.receive().await
    }

    /// Wait for the next queued work item
    pub async fn next_work_item(&self) -> WorkItem {
        self.work.receive().await
    }

    /// Wait for the next session event
    pub async fn next_session_event(&self) -> SessionEvent {
        self.events.receive().await
    }

    /// Next session event, if one is queued
    pub fn try_next_session_event(&self) -> Option<SessionEvent> {
        self.events.try_receive()
    }

    pub(crate) fn schedule(&self, item: WorkItem) {
        if self.work.try_send(item).is_err() {
            warn!("[CLIENT] Work queue full, dropping {:?}", item);
        }
    }

    /// Apply one transport callback
    ///
    /// # Errors
    /// Returns lock, lookup and capacity errors from the transition. Transport
    /// failures carried by the event are published, not returned.
    pub async fn handle_transport_event(&self, event: TransportEvent) -> Result<(), UnicastError> {
        trace!("[CLIENT] Transport event {:?}", event);
        match event {
            TransportEvent::Connected { peer, handle } => self.on_connected(peer, handle).await,
            TransportEvent::Disconnected { peer } => self.on_disconnected(peer).await,
            TransportEvent::Location {
                peer,
                direction,
                locations,
            } => self.on_location(peer, direction, locations).await,
            TransportEvent::AvailableContext { peer, sink, source } => {
                self.on_available_context(peer, sink, source).await
            }
            TransportEvent::CodecCapability {
                peer,
                direction,
                capability,
            } => self.on_codec_capability(peer, direction, capability).await,
            TransportEvent::Endpoint {
                peer,
                direction,
                endpoint,
                stream,
            } => self.on_endpoint(peer, direction, endpoint, stream).await,
            TransportEvent::DiscoverComplete {
                peer,
                direction,
                result,
            } => self.on_discover_complete(peer, direction, result).await,
            TransportEvent::CoordinatedSet { peer, set } => self.on_coordinated_set(peer, set).await,
            TransportEvent::Configured { stream, qos } => self.on_configured(stream, qos).await,
            TransportEvent::QosSet { stream } => {
                self.set_stream_state(stream, StreamState::QosConfigured).await
            }
            TransportEvent::Enabled { stream } => {
                self.set_stream_state(stream, StreamState::Enabled).await
            }
            TransportEvent::Started { stream } => self.on_started(stream).await,
            TransportEvent::MetadataUpdated { stream } => {
                debug!("[STREAM] Metadata updated on {}", stream);
                Ok(())
            }
            TransportEvent::Disabled { stream } => {
                self.set_stream_state(stream, StreamState::Stopping).await
            }
            TransportEvent::Stopped { stream, reason } => self.on_stopped(stream, reason).await,
            TransportEvent::Released { stream } => self.on_released(stream).await,
            TransportEvent::StartComplete { result } => self.on_start_complete(result).await,
            TransportEvent::StopComplete { result } => self.on_stop_complete(result).await,
            TransportEvent::UpdateComplete { result } => {
                self.on_update_complete(result);
                Ok(())
            }
        }
    }

    /// Run one work item
    ///
    /// # Errors
    /// Returns errors from the start or rebuild it performs. A retried start
    /// that finds nothing to start is not an error.
    pub async fn process_work(&self, item: WorkItem) -> Result<(), UnicastError> {
        debug!("[CLIENT] Work item {:?}", item);
        let result = match item {
            WorkItem::RetryStart => self.start_session().await,
            WorkItem::RebuildGroup => self.rebuild_group().await,
        };
        match result {
            Err(UnicastError::NothingToStart) => Ok(()),
            other => other,
        }
    }

    /// Drain both queues until they are empty
    ///
    /// Hosts without a dedicated processor task can call this after feeding
    /// transport events. Errors are logged and processing continues.
    pub async fn process_pending(&self) {
        loop {
            if let Ok(event) = self.inbox.try_receive() {
                if let Err(e) = self.handle_transport_event(event).await {
                    warn!("[CLIENT] Transport event failed: {:?}", e);
                }
            } else if let Ok(item) = self.work.try_receive() {
                if let Err(e) = self.process_work(item).await {
                    warn!("[CLIENT] Work item failed: {:?}", e);
                }
            } else {
                break;
            }
        }
    }

    /// Codec configuration of a stream as `(bitrate, sample_rate)`
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` for an unknown stream and
    /// `UnicastError::NoValidConfig` if it has not been configured yet.
    pub async fn get_config(&self, stream: StreamRef) -> Result<(u32, u32), UnicastError> {
        let store = self.lock().await?;
        let position = store.find_stream(stream)?;
        let preset = store.preset(position)?;
        if !preset.is_configured() {
            return Err(UnicastError::NoValidConfig);
        }
        Ok((preset.config.bitrate(), preset.config.sampling_frequency_hz))
    }

    /// Send one frame to every streaming sink stream
    ///
    /// Each stream gets the channel block(s) matching its allocation: left and
    /// mono streams take block 0, right streams block 1, two-channel streams
    /// both. A single-channel frame is duplicated onto every stream.
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if no sink is streaming,
    /// `UnicastError::InvalidParameter` for a frame without channels and the
    /// first transport failure after every stream has been attempted.
    pub async fn send_audio(&self, frame: &AudioFrame<'_>) -> Result<(), UnicastError> {
        if frame.channels == 0 {
            return Err(UnicastError::InvalidParameter);
        }

        let targets = {
            let store = self.lock().await?;
            let mut targets: Vec<(StreamRef, AudioLocation), MAX_GROUP_MEMBERS> = Vec::new();
            store.for_each_matching(
                |entry| {
                    entry.direction == Direction::Sink
                        && entry.stream.state == StreamState::Streaming
                },
                |entry| {
                    targets
                        .push((entry.stream.handle, entry.preset.config.channel_allocation))
                        .ok();
                },
            );
            targets
        };

        if targets.is_empty() {
            return Err(UnicastError::NotFound);
        }

        let mut first_error = None;
        for (stream, allocation) in targets {
            let result = match route_payload(frame, allocation) {
                Ok(payload) => self
                    .transport
                    .send(stream, &payload)
                    .await
                    .map_err(UnicastError::from),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("[STREAM] Send on {} failed: {:?}", stream, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Remove every peer record; only allowed once no stream is active
    ///
    /// # Errors
    /// Returns `UnicastError::SessionActive` while streams are active
    /// and transport errors from deleting the group.
    pub async fn clear_session(&self) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        if store.count_matching(|entry| entry.stream.state.is_engaged()) > 0 {
            return Err(UnicastError::SessionActive);
        }
        if store.group().exists() {
            self.transport.delete_group().await?;
        }
        store.clear()?;
        info!("[CLIENT] Session cleared");
        Ok(())
    }
}

fn route_payload(
    frame: &AudioFrame<'_>,
    allocation: AudioLocation,
) -> Result<Vec<u8, MAX_SDU_LENGTH>, UnicastError> {
    let left = frame.block(0).ok_or(UnicastError::InvalidParameter)?;
    let right = frame.block(1).unwrap_or(left);

    let mut payload = Vec::new();
    let parts: &[&[u8]] = match allocation {
        AudioLocation::FRONT_RIGHT => &[right],
        AudioLocation::STEREO => &[left, right],
        _ => &[left],
    };
    for part in parts {
        payload
            .extend_from_slice(part)
            .map_err(|()| UnicastError::CapacityExceeded)?;
    }
    Ok(payload)
}

/// Codec configuration for a direction
pub(crate) fn preset_for(options: &UnicastOptions, direction: Direction) -> CodecConfig {
    match direction {
        Direction::Sink => options.sink_preset,
        Direction::Source => options.source_preset,
    }
}

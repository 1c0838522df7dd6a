//! Test fixtures: a scripted transport and pre-populated stores

use crate::{
    AudioContexts, Direction, EndpointHandle, GroupId, PeerAddress, SessionEvent, StreamRef,
    TransportEvent, UnicastClient, UnicastOptions, UnicastTransport,
    audio::{AudioLocation, CodecCapability, CodecConfig, QosPreference},
    constants::MAX_SDU_LENGTH,
    group::GroupParams,
    store::{DiscoveryState, SessionStore, StoreGuard, StreamState},
    transport::TransportError,
};
use bt_hci::param::{BdAddr, ConnHandle};
use core::cell::{Cell, RefCell};
use embassy_time::Duration;
use heapless::{Deque, Vec};

pub fn peer(n: u8) -> PeerAddress {
    PeerAddress::new([0xC0, 0x00, 0x00, 0x00, 0x00, n])
}

pub fn test_qos() -> QosPreference {
    QosPreference::with_delay(1000, 4000, 2000, 3000)
}

pub fn test_options() -> UnicastOptions {
    UnicastOptions {
        lock_timeout: Duration::from_millis(100),
        gate_timeout: Duration::from_millis(50),
        ..UnicastOptions::default()
    }
}

/// Stream handle the fixtures bind to endpoint `index` of a record in `slot`
pub fn stream_ref(slot: usize, direction: Direction, index: usize) -> StreamRef {
    let base = 0x100 + slot as u16 * 0x20 + index as u16;
    match direction {
        Direction::Sink => StreamRef(base),
        Direction::Source => StreamRef(base + 0x10),
    }
}

/// Add a peer whose endpoints are already codec-configured with a committed delay
fn install_peer(store: &mut StoreGuard<'_>, peer: PeerAddress, sinks: u8, sources: u8) {
    store.add(peer).unwrap();
    let slot = store
        .records()
        .find(|(_, record)| record.identity() == peer)
        .map(|(slot, _)| slot)
        .unwrap();
    let record = store.get_by_index_mut(slot).unwrap();
    for (direction, count, config) in [
        (Direction::Sink, sinks, CodecConfig::lc3_48_4_1()),
        (Direction::Source, sources, CodecConfig::lc3_16_2_1()),
    ] {
        let state = record.direction_mut(direction);
        for index in 0..usize::from(count) {
            let stream = stream_ref(slot, direction, index);
            state
                .push_endpoint(EndpointHandle(stream.0), stream)
                .unwrap();
            let (preset, slot_state) = state.entry_mut(index).unwrap();
            preset.config = config.with_allocation(AudioLocation::MONO);
            preset.qos = test_qos();
            preset.presentation_delay_us = 2000;
            slot_state.state = StreamState::Configured;
        }
        if count > 0 {
            state.discovery = DiscoveryState::Configured;
        }
    }
}

pub async fn configured_store(peers: &[(PeerAddress, u8, u8)]) -> SessionStore {
    let store = SessionStore::new();
    {
        let mut guard = store.lock(Duration::from_millis(10)).await.unwrap();
        for (peer, sinks, sources) in peers {
            install_peer(&mut guard, *peer, *sinks, *sources);
        }
    }
    store
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Discover {
        peer: PeerAddress,
        direction: Direction,
    },
    ConfigureCodec {
        stream: StreamRef,
        allocation: AudioLocation,
    },
    CreateGroup {
        id: GroupId,
        members: usize,
        delay_us: u32,
    },
    DeleteGroup,
    Start {
        streams: usize,
    },
    Stop {
        streams: usize,
        release: bool,
    },
    UpdateMetadata {
        streams: usize,
        contexts: AudioContexts,
    },
    Send {
        stream: StreamRef,
    },
}

pub type Payload = Vec<u8, MAX_SDU_LENGTH>;

/// Transport double recording every call
#[derive(Default)]
pub struct MockTransport {
    calls: RefCell<Vec<Call, 64>>,
    start_results: RefCell<Deque<Result<(), TransportError>, 4>>,
    failing_sends: RefCell<Vec<StreamRef, 4>>,
    fail_delete: Cell<bool>,
    sent: RefCell<Vec<(StreamRef, Payload), 8>>,
    in_flight: Cell<bool>,
    overlap: Cell<bool>,
}

impl MockTransport {
    pub fn calls(&self) -> Vec<Call, 64> {
        self.calls.borrow().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| predicate(c)).count()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn overlapped(&self) -> bool {
        self.overlap.get()
    }

    pub fn sent(&self) -> Vec<(StreamRef, Payload), 8> {
        self.sent.borrow().clone()
    }

    /// Result of the next `start` call; later calls succeed
    pub fn script_start(&self, result: Result<(), TransportError>) {
        self.start_results.borrow_mut().push_back(result).unwrap();
    }

    /// Make the next `delete_group` call fail
    pub fn fail_next_delete(&self) {
        self.fail_delete.set(true);
    }

    pub fn fail_sends_on(&self, stream: StreamRef) {
        self.failing_sends.borrow_mut().push(stream).unwrap();
    }

    async fn enter(&self, call: Call) {
        if self.in_flight.replace(true) {
            self.overlap.set(true);
        }
        self.calls.borrow_mut().push(call).unwrap();
        embassy_futures::yield_now().await;
        self.in_flight.set(false);
    }
}

impl UnicastTransport for MockTransport {
    async fn discover(&self, peer: PeerAddress, direction: Direction) -> Result<(), TransportError> {
        self.enter(Call::Discover { peer, direction }).await;
        Ok(())
    }

    async fn configure_codec(
        &self,
        stream: StreamRef,
        _endpoint: EndpointHandle,
        config: &CodecConfig,
    ) -> Result<(), TransportError> {
        self.enter(Call::ConfigureCodec {
            stream,
            allocation: config.channel_allocation,
        })
        .await;
        Ok(())
    }

    async fn create_group(&self, params: &GroupParams<'_>) -> Result<(), TransportError> {
        self.enter(Call::CreateGroup {
            id: params.id,
            members: params.members.len(),
            delay_us: params.presentation_delay_us,
        })
        .await;
        Ok(())
    }

    async fn delete_group(&self) -> Result<(), TransportError> {
        self.enter(Call::DeleteGroup).await;
        if self.fail_delete.replace(false) {
            return Err(TransportError::Code(-16));
        }
        Ok(())
    }

    async fn start(
        &self,
        streams: &[StreamRef],
        _contexts: AudioContexts,
    ) -> Result<(), TransportError> {
        self.enter(Call::Start {
            streams: streams.len(),
        })
        .await;
        self.start_results.borrow_mut().pop_front().unwrap_or(Ok(()))
    }

    async fn stop(&self, streams: &[StreamRef], release: bool) -> Result<(), TransportError> {
        self.enter(Call::Stop {
            streams: streams.len(),
            release,
        })
        .await;
        Ok(())
    }

    async fn update_metadata(
        &self,
        streams: &[StreamRef],
        contexts: AudioContexts,
    ) -> Result<(), TransportError> {
        self.enter(Call::UpdateMetadata {
            streams: streams.len(),
            contexts,
        })
        .await;
        Ok(())
    }

    async fn send(&self, stream: StreamRef, payload: &[u8]) -> Result<(), TransportError> {
        self.enter(Call::Send { stream }).await;
        if self.failing_sends.borrow().contains(&stream) {
            return Err(TransportError::Code(-5));
        }
        let payload = Payload::from_slice(payload).map_err(|()| TransportError::Code(-7))?;
        self.sent.borrow_mut().push((stream, payload)).unwrap();
        Ok(())
    }
}

pub type TestClient = UnicastClient<MockTransport>;

impl Default for TestClient {
    fn default() -> Self {
        UnicastClient::new(MockTransport::default(), test_options())
    }
}

pub async fn configured_client(peers: &[(PeerAddress, u8, u8)]) -> TestClient {
    let client = TestClient::default();
    for (peer, sinks, sources) in peers {
        client.configure_peer(*peer, *sinks, *sources).await;
    }
    client
}

pub fn drain_events(client: &TestClient) -> Vec<SessionEvent, 16> {
    let mut events = Vec::new();
    while let Some(event) = client.try_next_session_event() {
        events.push(event).unwrap();
    }
    events
}

pub fn stream_state(client: &TestClient, stream: StreamRef) -> StreamState {
    let store = client.store().try_lock().unwrap();
    let position = store.find_stream(stream).unwrap();
    store.stream(position).unwrap().state
}

impl TestClient {
    /// Deliver a transport event and run everything it queues
    pub async fn feed(&self, event: TransportEvent) {
        self.notify(event).unwrap();
        self.process_pending().await;
    }

    pub async fn configure_peer(&self, peer: PeerAddress, sinks: u8, sources: u8) {
        let mut store = self.store().lock(Duration::from_millis(10)).await.unwrap();
        install_peer(&mut store, peer, sinks, sources);
    }

    /// Bind an unconfigured endpoint to `stream`, adding the peer if needed
    pub async fn add_endpoint(&self, peer: PeerAddress, direction: Direction, stream: StreamRef) {
        let mut store = self.store().lock(Duration::from_millis(10)).await.unwrap();
        if store.get_by_identity(&peer).is_err() {
            store.add(peer).unwrap();
        }
        store
            .get_by_identity_mut(&peer)
            .unwrap()
            .direction_mut(direction)
            .push_endpoint(EndpointHandle(stream.0), stream)
            .unwrap();
    }

    /// Start the session and walk every group member to streaming
    pub async fn start_streaming(&self) {
        self.start_session().await.unwrap();
        let members = self.store().try_lock().unwrap().group().streams();
        for stream in members {
            if stream_state(self, stream) == StreamState::Streaming {
                continue;
            }
            self.feed(TransportEvent::QosSet { stream }).await;
            self.feed(TransportEvent::Enabled { stream }).await;
            self.feed(TransportEvent::Started { stream }).await;
        }
        self.feed(TransportEvent::StartComplete { result: Ok(()) }).await;
    }

    /// Walk streams through disable, stop and release
    pub async fn release_streams(&self, streams: &[StreamRef]) {
        for stream in streams {
            self.feed(TransportEvent::Disabled { stream: *stream }).await;
            self.feed(TransportEvent::Stopped {
                stream: *stream,
                reason: 0x13,
            })
            .await;
            self.feed(TransportEvent::Released { stream: *stream }).await;
        }
    }

    /// Connect a peer and run sink discovery to completion
    ///
    /// The peer reports `locations` and one endpoint per entry of `streams`.
    pub async fn connect(&self, peer: PeerAddress, locations: AudioLocation, streams: &[StreamRef]) {
        let handle = ConnHandle::new(u16::from(peer.as_bytes()[5]));
        self.feed(TransportEvent::connected(&BdAddr::new(*peer.as_bytes()), handle))
            .await;
        self.report_direction(peer, Direction::Sink, locations, streams)
            .await;
    }

    /// Report discovery results for one direction and complete it
    pub async fn report_direction(
        &self,
        peer: PeerAddress,
        direction: Direction,
        locations: AudioLocation,
        streams: &[StreamRef],
    ) {
        self.feed(TransportEvent::Location {
            peer,
            direction,
            locations,
        })
        .await;
        self.feed(TransportEvent::CodecCapability {
            peer,
            direction,
            capability: CodecCapability::lc3_default(),
        })
        .await;
        for stream in streams {
            self.feed(TransportEvent::Endpoint {
                peer,
                direction,
                endpoint: EndpointHandle(stream.0),
                stream: *stream,
            })
            .await;
        }
        self.feed(TransportEvent::DiscoverComplete {
            peer,
            direction,
            result: Ok(()),
        })
        .await;
    }
}

//! Discovery Coordinator
//!
//! Per-peer, per-direction discovery: `Idle -> Discovering -> Configuring ->
//! Configured`, or `Failed`. Sink discovery always completes before source
//! discovery is requested, because the sink's location negotiation decides
//! whether the peer needs a source stream at all.

use super::{UnicastClient, preset_for};
use crate::{
    Direction, EndpointHandle, PeerAddress, StreamRef, UnicastError, UnicastTransport,
    audio::{AudioContexts, AudioLocation, CodecCapability, CodecConfig, assign_channels},
    constants::MAX_ENDPOINTS,
    events::SessionEvent,
    store::{CoordinatedSet, DiscoveryState, SessionRecord, StoreGuard, StreamState},
    transport::TransportError,
};
use bt_hci::param::ConnHandle;
use heapless::Vec;

/// Sink discovery has reported its endpoints (successfully or not)
fn sink_discovered(record: &SessionRecord) -> bool {
    !matches!(
        record.sink.discovery,
        DiscoveryState::Idle | DiscoveryState::Discovering
    )
}

/// Mark the group for reconfiguration if it holds any of `streams`
fn flag_group_member(store: &mut StoreGuard<'_>, streams: &[StreamRef]) {
    if streams.iter().any(|s| store.group().contains(*s)) {
        debug!("[GROUP] Member streams changed, group marked for reconfiguration");
        store.group_mut().reconfig_pending = true;
    }
}

fn record_streams(record: &SessionRecord) -> Vec<StreamRef, { 2 * MAX_ENDPOINTS }> {
    record
        .sink
        .streams()
        .iter()
        .chain(record.source.streams())
        .map(|slot| slot.handle)
        .collect()
}

impl<T: UnicastTransport> UnicastClient<T> {
    /// Request endpoint discovery for one direction of a peer
    ///
    /// The peer gets a session record if it has none. A source request made
    /// before sink discovery has completed is remembered and issued once it
    /// has; if sink discovery was never requested it is requested first.
    ///
    /// # Errors
    /// Returns `UnicastError::SessionActive` if streams of the direction
    /// still hold transport resources, store errors, and the transport's
    /// rejection of the discovery request.
    pub async fn discover_peer(
        &self,
        peer: PeerAddress,
        direction: Direction,
    ) -> Result<(), UnicastError> {
        let direction = {
            let mut store = self.lock().await?;
            if store.get_by_identity(&peer).is_err() {
                store.add(peer)?;
            }

            let record = store.get_by_identity_mut(&peer)?;
            let direction = if direction == Direction::Source && !sink_discovered(record) {
                record.pending_source = true;
                if record.sink.discovery != DiscoveryState::Idle {
                    debug!("[DISCOVERY] Source of {} deferred until sink completes", peer);
                    return Ok(());
                }
                Direction::Sink
            } else {
                direction
            };

            let state = record.direction(direction);
            if matches!(
                state.discovery,
                DiscoveryState::Discovering | DiscoveryState::Configuring
            ) {
                debug!("[DISCOVERY] {:?} of {} already in progress", direction, peer);
                return Ok(());
            }
            if state.streams().iter().any(|s| s.state.is_engaged()) {
                warn!("[DISCOVERY] {:?} of {} has active streams", direction, peer);
                return Err(UnicastError::SessionActive);
            }

            let previous: Vec<StreamRef, MAX_ENDPOINTS> =
                state.streams().iter().map(|s| s.handle).collect();
            let state = record.direction_mut(direction);
            state.reset();
            state.discovery = DiscoveryState::Discovering;
            flag_group_member(&mut store, &previous);
            direction
        };

        info!("[DISCOVERY] Discovering {:?} of {}", direction, peer);
        if let Err(e) = self.transport.discover(peer, direction).await {
            warn!("[DISCOVERY] Discovery request for {} failed: {:?}", peer, e);
            let mut store = self.lock().await?;
            if let Ok(record) = store.get_by_identity_mut(&peer) {
                record.direction_mut(direction).discovery = DiscoveryState::Failed;
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Forget a peer; only allowed once none of its streams is active
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` for an unknown peer and
    /// `UnicastError::SessionActive` while its streams are active.
    pub async fn remove_peer(&self, peer: PeerAddress) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let record = store.get_by_identity(&peer)?;
        if record
            .sink
            .streams()
            .iter()
            .chain(record.source.streams())
            .any(|s| s.state.is_engaged())
        {
            return Err(UnicastError::SessionActive);
        }
        let streams = record_streams(record);
        store.remove(&peer)?;
        flag_group_member(&mut store, &streams);
        info!("[DISCOVERY] Removed {}", peer);
        Ok(())
    }

    pub(super) async fn on_connected(
        &self,
        peer: PeerAddress,
        handle: ConnHandle,
    ) -> Result<(), UnicastError> {
        {
            let mut store = self.lock().await?;
            let streaming_before = store.streaming_count();
            let stale = match store.get_by_identity_mut(&peer) {
                Ok(record) => {
                    let streams = record_streams(record);
                    record.reset_directions();
                    record.conn_handle = Some(handle);
                    Some(streams)
                }
                Err(_) => {
                    store.add(peer)?.conn_handle = Some(handle);
                    None
                }
            };

            if let Some(streams) = stale {
                info!("[DISCOVERY] {} reconnected, record reset", peer);
                flag_group_member(&mut store, &streams);
                if streaming_before > 0 && store.streaming_count() == 0 {
                    self.events.publish(SessionEvent::NotStreaming);
                }
            } else {
                info!("[DISCOVERY] {} connected", peer);
            }
        }
        self.discover_peer(peer, Direction::Sink).await
    }

    pub(super) async fn on_disconnected(&self, peer: PeerAddress) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let Ok(record) = store.get_by_identity(&peer) else {
            debug!("[DISCOVERY] Disconnect of unknown peer {}", peer);
            return Ok(());
        };
        let streams = record_streams(record);
        let streaming_before = store.streaming_count();

        store.remove(&peer)?;
        flag_group_member(&mut store, &streams);
        info!("[DISCOVERY] {} disconnected", peer);

        if streaming_before > 0 && store.streaming_count() == 0 {
            self.events.publish(SessionEvent::NotStreaming);
        }
        self.check_rebuild(&store);
        Ok(())
    }

    pub(super) async fn on_location(
        &self,
        peer: PeerAddress,
        direction: Direction,
        locations: AudioLocation,
    ) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let record = store.get_by_identity_mut(&peer)?;
        let valid = AudioLocation(locations.0 & AudioLocation::SUPPORTED.0);
        if valid != locations {
            warn!(
                "[DISCOVERY] {} reported undefined location bits {:x}",
                peer,
                locations.0 & !AudioLocation::SUPPORTED.0
            );
        }
        record.direction_mut(direction).valid_locations = valid;
        Ok(())
    }

    pub(super) async fn on_available_context(
        &self,
        peer: PeerAddress,
        sink: AudioContexts,
        source: AudioContexts,
    ) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let record = store.get_by_identity_mut(&peer)?;
        record.sink.available_context = sink;
        record.source.available_context = source;
        Ok(())
    }

    pub(super) async fn on_codec_capability(
        &self,
        peer: PeerAddress,
        direction: Direction,
        capability: CodecCapability,
    ) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        store
            .get_by_identity_mut(&peer)?
            .direction_mut(direction)
            .push_codec_capability(capability)
            .inspect_err(|_| warn!("[DISCOVERY] Too many codec capabilities from {}", peer))
    }

    pub(super) async fn on_endpoint(
        &self,
        peer: PeerAddress,
        direction: Direction,
        endpoint: EndpointHandle,
        stream: StreamRef,
    ) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let index = store
            .get_by_identity_mut(&peer)?
            .direction_mut(direction)
            .push_endpoint(endpoint, stream)
            .inspect_err(|_| warn!("[DISCOVERY] Endpoint table of {} full", peer))?;
        debug!(
            "[DISCOVERY] {} {:?} endpoint {} bound to stream {} at {}",
            peer, direction, endpoint.0, stream, index
        );
        Ok(())
    }

    pub(super) async fn on_discover_complete(
        &self,
        peer: PeerAddress,
        direction: Direction,
        result: Result<(), TransportError>,
    ) -> Result<(), UnicastError> {
        let mut configure: Vec<(StreamRef, EndpointHandle, CodecConfig), MAX_ENDPOINTS> =
            Vec::new();
        let discover_source = {
            let mut store = self.lock().await?;
            let bidirectional = self.options.bidirectional;
            let record = store.get_by_identity_mut(&peer)?;
            let pending_source = core::mem::take(&mut record.pending_source);
            let discover_source = direction == Direction::Sink && (bidirectional || pending_source);

            if let Err(e) = result {
                warn!("[DISCOVERY] {:?} discovery of {} failed: {:?}", direction, peer, e);
                record.direction_mut(direction).discovery = DiscoveryState::Failed;
                self.events
                    .publish(SessionEvent::NoValidConfig { peer, direction });
                return Ok(());
            }

            let preset = preset_for(&self.options, direction);
            let state = record.direction(direction);
            let assignment = state
                .codec_capabilities
                .iter()
                .find(|cap| cap.supports(&preset))
                .ok_or(UnicastError::NoValidConfig)
                .and_then(|cap| assign_channels(state.valid_locations, cap, state.len()));

            match assignment {
                Ok(assignment) => {
                    info!(
                        "[DISCOVERY] {} {:?} assigned {}",
                        peer,
                        direction,
                        assignment.label()
                    );
                    if direction == Direction::Sink {
                        record.set_display_name(assignment.label());
                    }
                    let state = record.direction_mut(direction);
                    for (index, allocation) in assignment.allocations().into_iter().enumerate() {
                        let endpoint = state
                            .endpoints()
                            .get(index)
                            .copied()
                            .ok_or(UnicastError::NotFound)?;
                        let (preset_slot, stream) = state.entry_mut(index)?;
                        preset_slot.config = preset.with_allocation(allocation);
                        stream.state = StreamState::Configuring;
                        configure
                            .push((stream.handle, endpoint, preset_slot.config))
                            .ok();
                    }
                    state.discovery = DiscoveryState::Configuring;
                }
                Err(e) => {
                    warn!(
                        "[DISCOVERY] No usable {:?} configuration for {}: {:?}",
                        direction, peer, e
                    );
                    record.direction_mut(direction).discovery = DiscoveryState::Configured;
                    self.events
                        .publish(SessionEvent::NoValidConfig { peer, direction });
                }
            }
            discover_source
        };

        let mut first_error = None;
        for (stream, endpoint, config) in &configure {
            if let Err(e) = self.transport.configure_codec(*stream, *endpoint, config).await {
                warn!("[DISCOVERY] Codec configuration of {} failed: {:?}", stream, e);
                self.abandon_configuration(*stream).await?;
                first_error.get_or_insert(UnicastError::from(e));
            }
        }

        if discover_source {
            self.discover_peer(peer, Direction::Source).await?;
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Return a stream whose codec configuration was rejected to idle
    async fn abandon_configuration(&self, stream: StreamRef) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let position = store.find_stream(stream)?;
        store.stream_mut(position)?.state = StreamState::Idle;
        let (record, direction, _) = store.get_by_stream_ref(stream)?;
        let peer = record.identity();
        let state = record.direction(direction);
        if !state
            .streams()
            .iter()
            .any(|s| s.state == StreamState::Configuring)
        {
            let settled = if state.presets().iter().any(|p| p.is_configured()) {
                DiscoveryState::Configured
            } else {
                DiscoveryState::Failed
            };
            store.get_by_identity_mut(&peer)?.direction_mut(direction).discovery = settled;
        }
        Ok(())
    }

    pub(super) async fn on_coordinated_set(
        &self,
        peer: PeerAddress,
        set: CoordinatedSet,
    ) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        store.get_by_identity_mut(&peer)?.coordinated_set = Some(set);
        info!(
            "[DISCOVERY] {} is member {} of set {:x} ({} devices)",
            peer, set.rank, set.identifier, set.size
        );
        self.events
            .publish(SessionEvent::CoordinatedSetDiscovered { peer, set });
        Ok(())
    }
}

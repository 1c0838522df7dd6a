//! Stream lifecycle handlers
//!
//! Applies the transport's per-stream notifications to the store and feeds
//! the event publisher. `NotStreaming` is published when a stream leaves the
//! streaming state and no stream of any peer is left streaming.

use super::{UnicastClient, WorkItem};
use crate::{
    Direction, GroupId, PeerAddress, StreamRef, UnicastError, UnicastTransport,
    audio::QosPreference,
    events::{SessionEvent, StreamNotification, translate},
    group::GroupLifecycle,
    presentation_delay,
    store::{DiscoveryState, StoreGuard, StreamState},
};

impl<T: UnicastTransport> UnicastClient<T> {
    /// Move a stream to `state`, returning its owner and previous state
    fn transition(
        store: &mut StoreGuard<'_>,
        stream: StreamRef,
        state: StreamState,
    ) -> Result<(PeerAddress, Direction, StreamState), UnicastError> {
        let position = store.find_stream(stream)?;
        let slot = store.stream_mut(position)?;
        let previous = core::mem::replace(&mut slot.state, state);
        trace!("[STREAM] {} {:?} -> {:?}", stream, previous, state);
        let peer = store.get_by_index(position.slot)?.identity();
        Ok((peer, position.direction, previous))
    }

    /// Publish `NotStreaming` if this transition ended the last streaming stream
    fn left_streaming(
        &self,
        store: &StoreGuard<'_>,
        notification: StreamNotification,
        (peer, direction, previous): (PeerAddress, Direction, StreamState),
        stream: StreamRef,
    ) {
        if previous != StreamState::Streaming {
            return;
        }
        if let Some(event) = translate(notification, peer, direction, stream, store.streaming_count())
        {
            info!("[STREAM] Session no longer streaming");
            self.events.publish(event);
        }
    }

    /// Queue a group rebuild once every remaining member of a pending group is idle
    pub(super) fn check_rebuild(&self, store: &StoreGuard<'_>) {
        let group = store.group();
        if group.lifecycle != GroupLifecycle::PendingRecreate {
            return;
        }
        let busy = group.streams().iter().any(|stream| {
            store
                .find_stream(*stream)
                .and_then(|position| store.stream(position))
                .is_ok_and(|slot| slot.state.is_engaged())
        });
        if busy {
            debug!("[GROUP] Waiting for members to release before rebuild");
        } else {
            self.schedule(WorkItem::RebuildGroup);
        }
    }

    pub(super) async fn set_stream_state(
        &self,
        stream: StreamRef,
        state: StreamState,
    ) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let owner = Self::transition(&mut store, stream, state)?;
        if state == StreamState::Stopping {
            self.left_streaming(&store, StreamNotification::Stopped, owner, stream);
        }
        Ok(())
    }

    pub(super) async fn on_configured(
        &self,
        stream: StreamRef,
        qos: QosPreference,
    ) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let position = store.find_stream(stream)?;
        let target: Option<GroupId> = store
            .stream(position)?
            .group
            .or_else(|| store.group().id().filter(|_| store.group().exists()));
        let committed = store.committed_delays(stream);
        let peer = store.get_by_index(position.slot)?.identity();
        let direction = position.direction;

        let resolution = match presentation_delay::resolve(&qos, target, &committed) {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!("[STREAM] No presentation delay for {}: {:?}", stream, e);
                let (preset, slot) = store.entry_mut(position)?;
                preset.qos = qos;
                preset.presentation_delay_us = 0;
                slot.state = StreamState::Idle;
                Self::settle_discovery(&mut store, peer, direction)?;
                self.events
                    .publish(SessionEvent::NoValidConfig { peer, direction });
                return Err(e);
            }
        };

        let delay = resolution.computed_delay_us;
        let (preset, slot) = store.entry_mut(position)?;
        preset.qos = qos;
        preset.presentation_delay_us = delay;
        slot.state = StreamState::Configured;

        if let Some(group) = target.filter(|_| resolution.group_reconfig_needed) {
            info!(
                "[STREAM] Group {} delay moves {:?} -> {} us for {}",
                group, resolution.previous_delay_us, delay, stream
            );
            store.retarget_group_delay(group, delay);
            if store.group().id() == Some(group) {
                let unicast_group = store.group_mut();
                unicast_group.presentation_delay_us = delay;
                unicast_group.reconfig_pending = true;
            }
        }

        Self::settle_discovery(&mut store, peer, direction)?;
        if let Some(event) = translate(StreamNotification::Configured, peer, direction, stream, 0) {
            self.events.publish(event);
        }
        Ok(())
    }

    /// Mark a direction configured once no stream of it is still configuring
    fn settle_discovery(
        store: &mut StoreGuard<'_>,
        peer: PeerAddress,
        direction: Direction,
    ) -> Result<(), UnicastError> {
        let state = store.get_by_identity_mut(&peer)?.direction_mut(direction);
        if state.discovery == DiscoveryState::Configuring
            && !state
                .streams()
                .iter()
                .any(|s| s.state == StreamState::Configuring)
        {
            state.discovery = DiscoveryState::Configured;
            debug!("[DISCOVERY] {:?} of {} configured", direction, peer);
        }
        Ok(())
    }

    pub(super) async fn on_started(&self, stream: StreamRef) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let (peer, direction, _) = Self::transition(&mut store, stream, StreamState::Streaming)?;
        info!("[STREAM] {} streaming ({} {:?})", stream, peer, direction);
        if let Some(event) = translate(
            StreamNotification::Started,
            peer,
            direction,
            stream,
            store.streaming_count(),
        ) {
            self.events.publish(event);
        }
        Ok(())
    }

    /// Only an enabled, streaming or stopping stream falls back to QoS configured
    pub(super) async fn on_stopped(&self, stream: StreamRef, reason: u8) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let position = store.find_stream(stream)?;
        let current = store.stream(position)?.state;
        if !matches!(
            current,
            StreamState::Enabled | StreamState::Streaming | StreamState::Stopping
        ) {
            debug!("[STREAM] Stop of {} ignored in {:?}", stream, current);
            return Ok(());
        }
        let owner = Self::transition(&mut store, stream, StreamState::QosConfigured)?;
        debug!("[STREAM] {} stopped, reason {:#x}", stream, reason);
        self.left_streaming(&store, StreamNotification::Stopped, owner, stream);
        Ok(())
    }

    pub(super) async fn on_released(&self, stream: StreamRef) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let position = store.find_stream(stream)?;
        let next = if store.preset(position)?.is_configured() {
            StreamState::Configured
        } else {
            StreamState::Idle
        };
        let owner = Self::transition(&mut store, stream, next)?;
        debug!("[STREAM] {} released", stream);
        self.left_streaming(&store, StreamNotification::Released, owner, stream);
        self.check_rebuild(&store);
        Ok(())
    }
}

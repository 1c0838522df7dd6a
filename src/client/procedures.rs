//! Procedure Coordinator
//!
//! Start, stop and update are group-wide transport procedures. Each one runs
//! under the [`ProcedureGate`](crate::procedure::ProcedureGate) from submission
//! until its completion event. A start requested while the gate is held is
//! folded into the gate's single retry marker and re-run after the release.
//!
//! Starting also owns the group lifecycle: the first start creates the group,
//! a start whose candidates the group does not cover releases the members and
//! rebuilds the group on the work queue once they are idle.

use super::{UnicastClient, WorkItem};
use crate::{
    AudioContexts, StreamRef, UnicastError, UnicastTransport,
    constants::MAX_PROCEDURE_STREAMS,
    events::SessionEvent,
    group::{GroupLifecycle, build_candidates, candidates_delay},
    precondition_violated,
    procedure::Procedure,
    store::{StoreGuard, StreamState},
    transport::TransportError,
};
use heapless::Vec;

type StreamList = Vec<StreamRef, MAX_PROCEDURE_STREAMS>;

impl<T: UnicastTransport> UnicastClient<T> {
    /// Release the gate, queueing the retry it may have been holding
    fn release_gate(&self) {
        if self.gate.release() {
            debug!("[PROCEDURE] Running deferred start");
            self.schedule(WorkItem::RetryStart);
        }
    }

    /// Start every configured stream that is not streaming yet
    ///
    /// Creates the group on first use. If the group exists but does not cover
    /// the candidates, or a member's delay moved, the members are released and
    /// the group is rebuilt before starting. A start requested while another
    /// procedure runs is deferred and re-run once that procedure completes.
    /// A start that finds a rebuild pending with every member idle queues the
    /// rebuild again, which recovers from a failed group deletion.
    ///
    /// # Errors
    /// Returns `UnicastError::NothingToStart` if no stream qualifies,
    /// `UnicastError::NoValidDelay` if the candidates share no delay, and
    /// transport errors other than busy.
    pub async fn start_session(&self) -> Result<(), UnicastError> {
        let mut store = self.lock().await?;
        let candidates = build_candidates(&store);
        if candidates.is_empty() {
            debug!("[PROCEDURE] Nothing to start");
            return Err(UnicastError::NothingToStart);
        }
        if !self.gate.try_acquire(Procedure::Start) {
            info!(
                "[PROCEDURE] {:?} in flight, start deferred",
                self.gate.holder()
            );
            self.gate.defer_retry();
            return Ok(());
        }

        match store.group().lifecycle {
            GroupLifecycle::Absent => {
                let delay = match candidates_delay(&candidates) {
                    Ok(delay) => delay,
                    Err(e) => {
                        warn!("[GROUP] Candidates share no presentation delay");
                        self.release_gate();
                        return Err(e);
                    }
                };
                let id = store.next_group_id();
                store
                    .group_mut()
                    .assign(id, &candidates, delay, self.options.packing);
                let streams = store.group().streams();
                store.tag_group_streams(&streams, Some(id));
                store.retarget_group_delay(id, delay);

                let created = match store.group().params() {
                    Some(params) => self
                        .transport
                        .create_group(&params)
                        .await
                        .map_err(UnicastError::from),
                    None => Err(precondition_violated("group assigned without parameters")),
                };
                if let Err(e) = created {
                    warn!("[GROUP] Group {} creation failed: {:?}", id, e);
                    store.tag_group_streams(&streams, None);
                    store.group_mut().reset();
                    self.release_gate();
                    return Err(e);
                }
                store.group_mut().lifecycle = GroupLifecycle::Created;
                info!(
                    "[GROUP] Group {} created with {} members at {} us",
                    id,
                    candidates.len(),
                    delay
                );
                self.submit_start(&store, &streams).await
            }
            GroupLifecycle::Created
                if store.group().covers(&candidates) && !store.group().reconfig_pending =>
            {
                let mut streams = StreamList::new();
                for candidate in &candidates {
                    streams.push(candidate.member.tx).ok();
                    if let Some(rx) = candidate.member.rx {
                        streams.push(rx).ok();
                    }
                }
                self.submit_start(&store, &streams).await
            }
            GroupLifecycle::Created => self.begin_recreate(&mut store).await,
            lifecycle => {
                debug!("[GROUP] Group {:?}, start waits for rebuild", lifecycle);
                self.release_gate();
                self.check_rebuild(&store);
                Ok(())
            }
        }
    }

    /// Submit a start for `streams`; the gate is held until `StartComplete`
    async fn submit_start(
        &self,
        store: &StoreGuard<'_>,
        streams: &[StreamRef],
    ) -> Result<(), UnicastError> {
        let context = self.context();
        match self.transport.start(streams, context).await {
            Ok(()) => {
                info!("[PROCEDURE] Start submitted for {} streams", streams.len());
                Ok(())
            }
            Err(TransportError::Busy) => {
                warn!("[PROCEDURE] Transport busy, start deferred");
                self.gate.defer_retry();
                Ok(())
            }
            Err(e) => {
                error!("[PROCEDURE] Start rejected: {:?}", e);
                self.release_gate();
                if store.streaming_count() == 0 {
                    self.events.publish(SessionEvent::NotStreaming);
                }
                Err(e.into())
            }
        }
    }

    /// Release the group's members so the group can be rebuilt
    async fn begin_recreate(&self, store: &mut StoreGuard<'_>) -> Result<(), UnicastError> {
        store.group_mut().lifecycle = GroupLifecycle::PendingRecreate;
        let mut engaged = StreamList::new();
        for stream in store.group().streams() {
            let busy = store
                .find_stream(stream)
                .and_then(|position| store.stream(position))
                .is_ok_and(|slot| slot.state.is_engaged());
            if busy {
                engaged.push(stream).ok();
            }
        }

        if engaged.is_empty() {
            info!("[GROUP] Membership changed, rebuilding group");
            self.schedule(WorkItem::RebuildGroup);
            self.release_gate();
            return Ok(());
        }

        info!(
            "[GROUP] Membership changed, releasing {} member streams",
            engaged.len()
        );
        self.gate.hand_over(Procedure::Stop);
        if let Err(e) = self.transport.stop(&engaged, true).await {
            error!("[GROUP] Releasing members failed: {:?}", e);
            store.group_mut().lifecycle = GroupLifecycle::Created;
            self.release_gate();
            return Err(e.into());
        }
        Ok(())
    }

    /// Delete the pending group once every member is idle, then start again
    pub(super) async fn rebuild_group(&self) -> Result<(), UnicastError> {
        {
            let mut store = self.lock().await?;
            let group = store.group();
            if group.lifecycle != GroupLifecycle::PendingRecreate {
                debug!("[GROUP] Rebuild skipped, group {:?}", group.lifecycle);
                return Ok(());
            }
            let streams = group.streams();
            let busy = streams.iter().any(|stream| {
                store
                    .find_stream(*stream)
                    .and_then(|position| store.stream(position))
                    .is_ok_and(|slot| slot.state.is_engaged())
            });
            if busy {
                debug!("[GROUP] Rebuild waits for members to release");
                return Ok(());
            }

            store.group_mut().lifecycle = GroupLifecycle::Deleting;
            if let Err(e) = self.transport.delete_group().await {
                warn!("[GROUP] Group deletion failed: {:?}", e);
                store.group_mut().lifecycle = GroupLifecycle::PendingRecreate;
                return Err(e.into());
            }
            info!("[GROUP] Group {:?} deleted", store.group().id());
            store.tag_group_streams(&streams, None);
            store.group_mut().reset();
        }
        self.start_session().await
    }

    /// Stop and release every active stream
    ///
    /// Waits for the gate for at most the configured gate timeout. Stopping
    /// with nothing active is not an error.
    ///
    /// # Errors
    /// Returns `UnicastError::GateTimeout`, lock errors and the transport's
    /// rejection of the stop.
    pub async fn stop_session(&self) -> Result<(), UnicastError> {
        self.gate
            .acquire(Procedure::Stop, self.options.gate_timeout)
            .await?;

        let streams = match self.lock().await {
            Ok(store) => collect_streams(&store, |state| {
                state.is_engaged() && state != StreamState::Stopping
            }),
            Err(e) => {
                self.release_gate();
                return Err(e);
            }
        };
        if streams.is_empty() {
            debug!("[PROCEDURE] Nothing to stop");
            self.release_gate();
            return Ok(());
        }

        info!("[PROCEDURE] Stopping {} streams", streams.len());
        if let Err(e) = self.transport.stop(&streams, true).await {
            error!("[PROCEDURE] Stop rejected: {:?}", e);
            self.release_gate();
            return Err(e.into());
        }
        Ok(())
    }

    /// Push new context metadata to every streaming stream
    ///
    /// The context also applies to later starts.
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if nothing is streaming,
    /// `UnicastError::GateTimeout`, lock errors and transport errors.
    pub async fn update_context(&self, contexts: AudioContexts) -> Result<(), UnicastError> {
        self.set_context(contexts);
        self.gate
            .acquire(Procedure::Update, self.options.gate_timeout)
            .await?;

        let streams = match self.lock().await {
            Ok(store) => collect_streams(&store, |state| state == StreamState::Streaming),
            Err(e) => {
                self.release_gate();
                return Err(e);
            }
        };
        if streams.is_empty() {
            self.release_gate();
            return Err(UnicastError::NotFound);
        }

        if let Err(e) = self.transport.update_metadata(&streams, contexts).await {
            warn!("[PROCEDURE] Metadata update rejected: {:?}", e);
            self.release_gate();
            return Err(e.into());
        }
        Ok(())
    }

    fn finish(&self, procedure: Procedure, result: Result<(), TransportError>) {
        let holder = self.gate.holder();
        if holder != Some(procedure) {
            warn!(
                "[PROCEDURE] {:?} completed while gate held by {:?}",
                procedure, holder
            );
        }
        match result {
            Ok(()) => debug!("[PROCEDURE] {:?} complete", procedure),
            Err(e) => warn!("[PROCEDURE] {:?} failed: {:?}", procedure, e),
        }
        self.release_gate();
    }

    pub(super) async fn on_start_complete(
        &self,
        result: Result<(), TransportError>,
    ) -> Result<(), UnicastError> {
        self.finish(Procedure::Start, result);
        if result.is_err() {
            let store = self.lock().await?;
            if store.streaming_count() == 0 {
                self.events.publish(SessionEvent::NotStreaming);
            }
        }
        Ok(())
    }

    pub(super) async fn on_stop_complete(
        &self,
        result: Result<(), TransportError>,
    ) -> Result<(), UnicastError> {
        self.finish(Procedure::Stop, result);
        let store = self.lock().await?;
        self.check_rebuild(&store);
        Ok(())
    }

    pub(super) fn on_update_complete(&self, result: Result<(), TransportError>) {
        self.finish(Procedure::Update, result);
    }
}

fn collect_streams(store: &StoreGuard<'_>, accept: impl Fn(StreamState) -> bool) -> StreamList {
    let mut streams = StreamList::new();
    store.for_each_matching(
        |entry| accept(entry.stream.state),
        |entry| {
            streams.push(entry.stream.handle).ok();
        },
    );
    streams
}

#[cfg(test)]
mod tests {
    use crate::{
        SessionEvent, StreamRef, TransportEvent, UnicastError,
        group::GroupLifecycle,
        procedure::Procedure,
        store::StreamState,
        testing::{Call, configured_client, drain_events, peer, stream_state},
        transport::TransportError,
    };
    use embassy_futures::join::join;

    #[test]
    fn test_nothing_to_start_leaves_gate_alone() {
        embassy_futures::block_on(async {
            let client = configured_client(&[]).await;
            assert_eq!(client.start_session().await, Err(UnicastError::NothingToStart));
            assert_eq!(client.gate().holder(), None);
            assert!(client.transport().calls().is_empty());
        });
    }

    #[test]
    fn test_first_start_creates_group() {
        embassy_futures::block_on(async {
            let client = configured_client(&[(peer(1), 1, 1), (peer(2), 1, 0)]).await;
            client.start_session().await.unwrap();

            let calls = client.transport().calls();
            assert!(matches!(calls[0], Call::CreateGroup { members: 2, delay_us: 2000, .. }));
            assert!(matches!(calls[1], Call::Start { streams: 3 }));
            assert_eq!(client.gate().holder(), Some(Procedure::Start));

            let store = client.store().try_lock().unwrap();
            assert_eq!(store.group().lifecycle, GroupLifecycle::Created);
            assert!(store.group().contains(StreamRef(0x110)));
        });
    }

    #[test]
    fn test_concurrent_starts_are_serialized() {
        embassy_futures::block_on(async {
            let client = configured_client(&[(peer(1), 1, 0)]).await;
            let (a, b) = join(client.start_session(), client.start_session()).await;
            assert_eq!((a, b), (Ok(()), Ok(())));
            assert_eq!(client.transport().count(|c| matches!(c, Call::Start { .. })), 1);
            assert!(client.gate().retry_pending());

            // The completion releases the gate and runs the coalesced retry once
            client.feed(TransportEvent::StartComplete { result: Ok(()) }).await;
            assert_eq!(client.transport().count(|c| matches!(c, Call::Start { .. })), 2);
            assert!(!client.transport().overlapped());
            assert!(!client.gate().retry_pending());
        });
    }

    #[test]
    fn test_busy_transport_retries_after_completion() {
        embassy_futures::block_on(async {
            let client = configured_client(&[(peer(1), 1, 0)]).await;
            client.transport().script_start(Err(TransportError::Busy));
            assert_eq!(client.start_session().await, Ok(()));
            assert_eq!(client.gate().holder(), Some(Procedure::Start));
            assert!(client.gate().retry_pending());

            client.feed(TransportEvent::StartComplete { result: Ok(()) }).await;
            assert_eq!(client.transport().count(|c| matches!(c, Call::Start { .. })), 2);
        });
    }

    #[test]
    fn test_rejected_start_publishes_not_streaming() {
        embassy_futures::block_on(async {
            let client = configured_client(&[(peer(1), 1, 0)]).await;
            client.transport().script_start(Err(TransportError::Code(-12)));
            assert_eq!(
                client.start_session().await,
                Err(UnicastError::TransportError(-12))
            );
            assert_eq!(client.gate().holder(), None);
            assert_eq!(drain_events(&client).as_slice(), &[SessionEvent::NotStreaming]);
        });
    }

    #[test]
    fn test_new_member_recreates_group() {
        embassy_futures::block_on(async {
            let client = configured_client(&[(peer(1), 1, 0)]).await;
            client.start_streaming().await;
            client.transport().clear_calls();

            client.configure_peer(peer(2), 1, 0).await;
            client.start_session().await.unwrap();
            assert!(matches!(
                client.transport().calls()[0],
                Call::Stop { streams: 1, release: true }
            ));
            assert_eq!(client.gate().holder(), Some(Procedure::Stop));

            client.release_streams(&[StreamRef(0x100)]).await;
            client.feed(TransportEvent::StopComplete { result: Ok(()) }).await;

            let calls = client.transport().calls();
            assert!(calls.contains(&Call::DeleteGroup));
            assert!(calls.iter().any(|c| matches!(c, Call::CreateGroup { members: 2, .. })));
            let store = client.store().try_lock().unwrap();
            assert_eq!(store.group().lifecycle, GroupLifecycle::Created);
            assert!(store.group().contains(StreamRef(0x120)));
            assert_eq!(store.group().id(), Some(2));
        });
    }

    #[test]
    fn test_failed_delete_is_retried_after_stop_completes() {
        embassy_futures::block_on(async {
            let client = configured_client(&[(peer(1), 1, 0)]).await;
            client.start_streaming().await;
            client.configure_peer(peer(2), 1, 0).await;
            client.start_session().await.unwrap();
            client.transport().clear_calls();

            // The rebuild runs once the last member is released and its delete fails
            client.transport().fail_next_delete();
            client.release_streams(&[StreamRef(0x100)]).await;
            assert_eq!(client.transport().calls().as_slice(), &[Call::DeleteGroup]);
            assert_eq!(
                client.store().try_lock().unwrap().group().lifecycle,
                GroupLifecycle::PendingRecreate
            );
            assert_eq!(client.gate().holder(), Some(Procedure::Stop));

            client.feed(TransportEvent::StopComplete { result: Ok(()) }).await;
            assert_eq!(
                client.transport().calls().as_slice(),
                &[
                    Call::DeleteGroup,
                    Call::DeleteGroup,
                    Call::CreateGroup {
                        id: 2,
                        members: 2,
                        delay_us: 2000,
                    },
                    Call::Start { streams: 2 },
                ]
            );
            let store = client.store().try_lock().unwrap();
            assert_eq!(store.group().lifecycle, GroupLifecycle::Created);
            assert!(store.group().contains(StreamRef(0x120)));
        });
    }

    #[test]
    fn test_start_requeues_stalled_rebuild() {
        embassy_futures::block_on(async {
            let client = configured_client(&[(peer(1), 1, 0)]).await;
            client.start_session().await.unwrap();
            client.feed(TransportEvent::StartComplete { result: Ok(()) }).await;
            client.store().try_lock().unwrap().group_mut().lifecycle =
                GroupLifecycle::PendingRecreate;
            client.transport().clear_calls();

            client.transport().fail_next_delete();
            client.start_session().await.unwrap();
            client.process_pending().await;
            assert_eq!(client.transport().calls().as_slice(), &[Call::DeleteGroup]);
            assert_eq!(client.gate().holder(), None);

            client.start_session().await.unwrap();
            client.process_pending().await;
            assert_eq!(
                &client.transport().calls()[1..],
                &[
                    Call::DeleteGroup,
                    Call::CreateGroup {
                        id: 2,
                        members: 1,
                        delay_us: 2000,
                    },
                    Call::Start { streams: 1 },
                ]
            );
            assert_eq!(
                client.store().try_lock().unwrap().group().lifecycle,
                GroupLifecycle::Created
            );
        });
    }

    #[test]
    fn test_stop_session() {
        embassy_futures::block_on(async {
            let client = configured_client(&[(peer(1), 1, 0)]).await;
            assert_eq!(client.stop_session().await, Ok(()));
            assert_eq!(client.gate().holder(), None);

            client.start_streaming().await;
            client.stop_session().await.unwrap();
            assert!(client
                .transport()
                .calls()
                .contains(&Call::Stop { streams: 1, release: true }));

            client.release_streams(&[StreamRef(0x100)]).await;
            client.feed(TransportEvent::StopComplete { result: Ok(()) }).await;
            assert_eq!(client.gate().holder(), None);
            assert_eq!(stream_state(&client, StreamRef(0x100)), StreamState::Configured);
            assert_eq!(drain_events(&client).last(), Some(&SessionEvent::NotStreaming));
        });
    }

    #[test]
    fn test_stop_waits_for_gate() {
        embassy_futures::block_on(async {
            let client = configured_client(&[(peer(1), 1, 0)]).await;
            client.start_session().await.unwrap();
            assert_eq!(client.stop_session().await, Err(UnicastError::GateTimeout));
        });
    }

    #[test]
    fn test_update_context() {
        embassy_futures::block_on(async {
            let client = configured_client(&[(peer(1), 1, 0)]).await;
            assert_eq!(
                client.update_context(crate::AudioContexts::GAME).await,
                Err(UnicastError::NotFound)
            );

            client.start_streaming().await;
            client.update_context(crate::AudioContexts::GAME).await.unwrap();
            assert!(client.transport().calls().contains(&Call::UpdateMetadata {
                streams: 1,
                contexts: crate::AudioContexts::GAME,
            }));
            assert_eq!(client.gate().holder(), Some(Procedure::Update));
            client.feed(TransportEvent::UpdateComplete { result: Ok(()) }).await;
            assert_eq!(client.gate().holder(), None);
        });
    }
}

//! Session Store
//!
//! A bounded table of per-peer session records with direction-specific state,
//! together with the session's unicast group. All of it lives behind one
//! embassy mutex. Every read and mutation goes through a [`StoreGuard`], which
//! can only be obtained by acquiring that mutex, so "lock must be held" is a
//! property of the types rather than a runtime check.
//!
//! ## Slots
//!
//! Records occupy fixed slots. `add` uses the lowest free slot and `remove`
//! frees a slot without compacting the table, so gaps can appear. Callers that
//! iterate `0..count` must ask for a dense count first.
//!
//! ## Parallel arrays
//!
//! For each direction, `endpoints`, `presets` and `streams` always have the same
//! length: entries are appended together and only ever cleared together.

use crate::{
    Direction, EndpointHandle, GroupId, PeerAddress, StreamRef, UnicastError,
    audio::{AudioContexts, AudioLocation, CodecCapability, Preset},
    constants::{
        MAX_CODEC_CAPABILITIES, MAX_DISPLAY_NAME_LENGTH, MAX_ENDPOINTS, MAX_PEERS, MAX_STREAMS,
    },
    group::UnicastGroup,
    presentation_delay::CommittedDelay,
};
use bt_hci::param::ConnHandle;
use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex,
    mutex::{Mutex, MutexGuard},
};
use embassy_time::{Duration, with_timeout};
use heapless::{String, Vec};

/// Discovery progress of one direction of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiscoveryState {
    /// Nothing requested yet
    #[default]
    Idle,
    /// Endpoint and capability discovery running
    Discovering,
    /// Codec configuration submitted for the selected endpoints
    Configuring,
    /// Discovery finished; presets hold whatever could be configured
    Configured,
    /// Discovery or configuration failed
    Failed,
}

/// Lifecycle of one local stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamState {
    /// Not configured
    #[default]
    Idle,
    /// Codec configuration in flight
    Configuring,
    /// Codec configured, not part of a running procedure
    Configured,
    /// QoS configured
    QosConfigured,
    /// Enabled, waiting for start
    Enabled,
    /// Audio flowing
    Streaming,
    /// Disable or stop in flight
    Stopping,
}

impl StreamState {
    /// The stream holds isochronous resources at the transport
    #[must_use]
    pub const fn is_engaged(self) -> bool {
        matches!(
            self,
            Self::QosConfigured | Self::Enabled | Self::Streaming | Self::Stopping
        )
    }
}

/// Local stream-control handle plus the state this host tracks for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamSlot {
    /// Handle owned by the transport
    pub handle: StreamRef,
    /// Tracked lifecycle state
    pub state: StreamState,
    /// Group generation the stream's delay is committed to
    pub group: Option<GroupId>,
}

/// Coordinated set descriptor discovered on a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CoordinatedSet {
    /// Set identifier (derived from the set identity resolving key)
    pub identifier: u32,
    /// Number of devices in the set
    pub size: u8,
    /// Rank of this device within the set
    pub rank: u8,
}

/// Per-direction state of a peer
#[derive(Debug, Clone, Default)]
pub struct DirectionState {
    /// Discovery progress
    pub discovery: DiscoveryState,
    /// Negotiated audio locations
    pub valid_locations: AudioLocation,
    /// Available audio contexts
    pub available_context: AudioContexts,
    /// Advertised codec capabilities, in discovery order
    pub codec_capabilities: Vec<CodecCapability, MAX_CODEC_CAPABILITIES>,
    endpoints: Vec<EndpointHandle, MAX_ENDPOINTS>,
    presets: Vec<Preset, MAX_ENDPOINTS>,
    streams: Vec<StreamSlot, MAX_ENDPOINTS>,
}

impl DirectionState {
    /// Whether discovery is currently running
    #[must_use]
    pub fn discovery_in_progress(&self) -> bool {
        self.discovery == DiscoveryState::Discovering
    }

    /// Discovered endpoints
    #[must_use]
    pub fn endpoints(&self) -> &[EndpointHandle] {
        &self.endpoints
    }

    /// Presets, parallel to `endpoints`
    #[must_use]
    pub fn presets(&self) -> &[Preset] {
        &self.presets
    }

    /// Stream slots, parallel to `endpoints`
    #[must_use]
    pub fn streams(&self) -> &[StreamSlot] {
        &self.streams
    }

    /// Number of discovered endpoints
    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// No endpoint discovered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Append an endpoint with its local stream and an empty preset
    ///
    /// # Errors
    /// Returns `UnicastError::CapacityExceeded` if the endpoint table is full;
    /// nothing is appended in that case.
    pub fn push_endpoint(
        &mut self,
        endpoint: EndpointHandle,
        stream: StreamRef,
    ) -> Result<usize, UnicastError> {
        if self.endpoints.is_full() || self.presets.is_full() || self.streams.is_full() {
            return Err(UnicastError::CapacityExceeded);
        }
        let index = self.endpoints.len();
        self.endpoints
            .push(endpoint)
            .map_err(|_| UnicastError::CapacityExceeded)?;
        self.presets
            .push(Preset::default())
            .map_err(|_| UnicastError::CapacityExceeded)?;
        self.streams
            .push(StreamSlot {
                handle: stream,
                state: StreamState::Idle,
                group: None,
            })
            .map_err(|_| UnicastError::CapacityExceeded)?;
        Ok(index)
    }

    /// Append a codec capability record
    ///
    /// # Errors
    /// Returns `UnicastError::CapacityExceeded` if the capability list is full.
    pub fn push_codec_capability(&mut self, cap: CodecCapability) -> Result<(), UnicastError> {
        self.codec_capabilities
            .push(cap)
            .map_err(|_| UnicastError::CapacityExceeded)
    }

    /// Mutable access to the preset and stream of one endpoint
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if `index` is out of range.
    pub fn entry_mut(&mut self, index: usize) -> Result<(&mut Preset, &mut StreamSlot), UnicastError> {
        match (self.presets.get_mut(index), self.streams.get_mut(index)) {
            (Some(preset), Some(stream)) => Ok((preset, stream)),
            _ => Err(UnicastError::NotFound),
        }
    }

    /// Clear everything learnt by discovery
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One peer participating in the session
#[derive(Debug, Clone)]
pub struct SessionRecord {
    identity: PeerAddress,
    /// ACL connection handle while connected
    pub conn_handle: Option<ConnHandle>,
    /// Diagnostic label derived from the negotiated sink location
    pub display_name: String<MAX_DISPLAY_NAME_LENGTH>,
    /// Coordinated set the peer belongs to
    pub coordinated_set: Option<CoordinatedSet>,
    /// Peer sink state (host transmits)
    pub sink: DirectionState,
    /// Peer source state (host receives)
    pub source: DirectionState,
    /// Source discovery was requested before sink discovery finished
    pub pending_source: bool,
}

impl SessionRecord {
    /// Create an empty record for a peer
    #[must_use]
    pub fn new(identity: PeerAddress) -> Self {
        Self {
            identity,
            conn_handle: None,
            display_name: String::new(),
            coordinated_set: None,
            sink: DirectionState::default(),
            source: DirectionState::default(),
            pending_source: false,
        }
    }

    /// Peer identity
    #[must_use]
    pub const fn identity(&self) -> PeerAddress {
        self.identity
    }

    /// State for one direction
    #[must_use]
    pub const fn direction(&self, direction: Direction) -> &DirectionState {
        match direction {
            Direction::Sink => &self.sink,
            Direction::Source => &self.source,
        }
    }

    /// Mutable state for one direction
    pub const fn direction_mut(&mut self, direction: Direction) -> &mut DirectionState {
        match direction {
            Direction::Sink => &mut self.sink,
            Direction::Source => &mut self.source,
        }
    }

    /// Reset both directions for re-discovery, keeping identity and set membership
    pub fn reset_directions(&mut self) {
        self.sink.reset();
        self.source.reset();
        self.display_name.clear();
        self.pending_source = false;
    }

    /// Replace the diagnostic label
    pub fn set_display_name(&mut self, label: &str) {
        self.display_name.clear();
        if self.display_name.push_str(label).is_err() {
            warn!("[STORE] Display name truncated for {}", self.identity);
        }
    }
}

/// Where a stream lives in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamPosition {
    /// Slot of the owning record
    pub slot: usize,
    /// Direction within the record
    pub direction: Direction,
    /// Index into the parallel arrays
    pub index: usize,
}

/// Read-only view of one endpoint entry, handed to store visitors
#[derive(Debug, Clone, Copy)]
pub struct StreamEntry<'r> {
    /// Owning peer
    pub peer: PeerAddress,
    /// Direction of the endpoint
    pub direction: Direction,
    /// Position in the store
    pub position: StreamPosition,
    /// Remote endpoint
    pub endpoint: EndpointHandle,
    /// Preset of the endpoint
    pub preset: &'r Preset,
    /// Local stream of the endpoint
    pub stream: &'r StreamSlot,
}

struct StoreInner {
    slots: [Option<SessionRecord>; MAX_PEERS],
    group: UnicastGroup,
    next_group_id: GroupId,
}

/// Lock-protected session table
pub struct SessionStore {
    inner: Mutex<CriticalSectionRawMutex, StoreInner>,
}

impl SessionStore {
    /// Create an empty store
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                slots: [const { None }; MAX_PEERS],
                group: UnicastGroup::new(),
                next_group_id: 1,
            }),
        }
    }

    /// Acquire the store lock, waiting at most `timeout`
    ///
    /// # Errors
    /// Returns `UnicastError::LockTimeout` if the lock could not be acquired in time.
    pub async fn lock(&self, timeout: Duration) -> Result<StoreGuard<'_>, UnicastError> {
        match with_timeout(timeout, self.inner.lock()).await {
            Ok(guard) => Ok(StoreGuard { guard }),
            Err(_) => {
                warn!("[STORE] Lock not acquired within {} ms", timeout.as_millis());
                Err(UnicastError::LockTimeout)
            }
        }
    }

    /// Acquire the store lock without waiting
    ///
    /// # Errors
    /// Returns `UnicastError::LockTimeout` if the lock is held elsewhere.
    pub fn try_lock(&self) -> Result<StoreGuard<'_>, UnicastError> {
        self.inner
            .try_lock()
            .map(|guard| StoreGuard { guard })
            .map_err(|_| UnicastError::LockTimeout)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of holding the store lock; all store access goes through it
pub struct StoreGuard<'a> {
    guard: MutexGuard<'a, CriticalSectionRawMutex, StoreInner>,
}

impl StoreGuard<'_> {
    /// Insert a fresh record at the lowest free slot
    ///
    /// # Errors
    /// Returns `UnicastError::AlreadyExists` if the identity is already present and
    /// `UnicastError::CapacityExceeded` if every slot is occupied.
    pub fn add(&mut self, identity: PeerAddress) -> Result<&mut SessionRecord, UnicastError> {
        if self.slot_of(&identity).is_some() {
            return Err(UnicastError::AlreadyExists);
        }
        let slot = self
            .guard
            .slots
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(UnicastError::CapacityExceeded)?;
        debug!("[STORE] Adding record for {}", identity);
        Ok(slot.insert(SessionRecord::new(identity)))
    }

    /// Free the slot of a record; remaining slots keep their positions
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if no record has this identity.
    pub fn remove(&mut self, identity: &PeerAddress) -> Result<(), UnicastError> {
        let slot = self.slot_of(identity).ok_or(UnicastError::NotFound)?;
        debug!("[STORE] Removing record for {} from slot {}", identity, slot);
        self.guard.slots[slot] = None;
        Ok(())
    }

    /// Number of occupied slots
    ///
    /// # Errors
    /// With `require_dense`, returns `UnicastError::NonDense` if a free slot
    /// precedes an occupied one.
    pub fn count(&self, require_dense: bool) -> Result<usize, UnicastError> {
        let count = self.guard.slots.iter().filter(|s| s.is_some()).count();
        if require_dense && self.guard.slots[..count].iter().any(Option::is_none) {
            return Err(UnicastError::NonDense);
        }
        Ok(count)
    }

    /// Remove every record and forget the group
    ///
    /// # Errors
    /// Returns `UnicastError::SessionActive` if any stream still holds
    /// transport resources.
    pub fn clear(&mut self) -> Result<(), UnicastError> {
        if self.count_matching(|entry| entry.stream.state.is_engaged()) > 0 {
            return Err(UnicastError::SessionActive);
        }
        for slot in &mut self.guard.slots {
            *slot = None;
        }
        self.guard.group.reset();
        Ok(())
    }

    fn slot_of(&self, identity: &PeerAddress) -> Option<usize> {
        self.guard
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|r| r.identity == *identity))
    }

    /// Record for a peer identity
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if no record has this identity.
    pub fn get_by_identity(&self, identity: &PeerAddress) -> Result<&SessionRecord, UnicastError> {
        let slot = self.slot_of(identity).ok_or(UnicastError::NotFound)?;
        self.get_by_index(slot)
    }

    /// Mutable record for a peer identity
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if no record has this identity.
    pub fn get_by_identity_mut(
        &mut self,
        identity: &PeerAddress,
    ) -> Result<&mut SessionRecord, UnicastError> {
        let slot = self.slot_of(identity).ok_or(UnicastError::NotFound)?;
        self.get_by_index_mut(slot)
    }

    /// Record in a slot
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if the slot is empty or out of range.
    pub fn get_by_index(&self, index: usize) -> Result<&SessionRecord, UnicastError> {
        self.guard
            .slots
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(UnicastError::NotFound)
    }

    /// Mutable record in a slot
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if the slot is empty or out of range.
    pub fn get_by_index_mut(&mut self, index: usize) -> Result<&mut SessionRecord, UnicastError> {
        self.guard
            .slots
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or(UnicastError::NotFound)
    }

    /// Locate a stream; the handle must be registered exactly once
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if no endpoint uses the handle and
    /// `UnicastError::AlreadyExists` if more than one does.
    pub fn find_stream(&self, stream: StreamRef) -> Result<StreamPosition, UnicastError> {
        let mut found = None;
        let mut duplicate = false;
        self.for_each_matching(
            |entry| entry.stream.handle == stream,
            |entry| {
                if found.replace(entry.position).is_some() {
                    duplicate = true;
                }
            },
        );
        if duplicate {
            error!("[STORE] Stream {} registered more than once", stream);
            return Err(UnicastError::AlreadyExists);
        }
        found.ok_or(UnicastError::NotFound)
    }

    /// Record, direction and endpoint index owning a stream
    ///
    /// # Errors
    /// See [`StoreGuard::find_stream`].
    pub fn get_by_stream_ref(
        &self,
        stream: StreamRef,
    ) -> Result<(&SessionRecord, Direction, usize), UnicastError> {
        let position = self.find_stream(stream)?;
        let record = self.get_by_index(position.slot)?;
        Ok((record, position.direction, position.index))
    }

    /// Preset at a position
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if the position is stale.
    pub fn preset(&self, position: StreamPosition) -> Result<&Preset, UnicastError> {
        self.get_by_index(position.slot)?
            .direction(position.direction)
            .presets()
            .get(position.index)
            .ok_or(UnicastError::NotFound)
    }

    /// Stream slot at a position
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if the position is stale.
    pub fn stream(&self, position: StreamPosition) -> Result<&StreamSlot, UnicastError> {
        self.get_by_index(position.slot)?
            .direction(position.direction)
            .streams()
            .get(position.index)
            .ok_or(UnicastError::NotFound)
    }

    /// Mutable stream slot at a position
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if the position is stale.
    pub fn stream_mut(&mut self, position: StreamPosition) -> Result<&mut StreamSlot, UnicastError> {
        Ok(self.entry_mut(position)?.1)
    }

    /// Mutable preset and stream slot at a position
    ///
    /// # Errors
    /// Returns `UnicastError::NotFound` if the position is stale.
    pub fn entry_mut(
        &mut self,
        position: StreamPosition,
    ) -> Result<(&mut Preset, &mut StreamSlot), UnicastError> {
        self.get_by_index_mut(position.slot)?
            .direction_mut(position.direction)
            .entry_mut(position.index)
    }

    /// Occupied records with their slots
    pub fn records(&self) -> impl Iterator<Item = (usize, &SessionRecord)> {
        self.guard
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, record)| record.as_ref().map(|r| (slot, r)))
    }

    /// Visit every endpoint entry, across all peers and directions, accepted by `predicate`
    pub fn for_each_matching<P, F>(&self, predicate: P, mut f: F)
    where
        P: Fn(&StreamEntry<'_>) -> bool,
        F: FnMut(&StreamEntry<'_>),
    {
        for (slot, record) in self.records() {
            for direction in [Direction::Sink, Direction::Source] {
                let state = record.direction(direction);
                for (index, ((endpoint, preset), stream)) in state
                    .endpoints()
                    .iter()
                    .zip(state.presets())
                    .zip(state.streams())
                    .enumerate()
                {
                    let entry = StreamEntry {
                        peer: record.identity,
                        direction,
                        position: StreamPosition {
                            slot,
                            direction,
                            index,
                        },
                        endpoint: *endpoint,
                        preset,
                        stream,
                    };
                    if predicate(&entry) {
                        f(&entry);
                    }
                }
            }
        }
    }

    /// Count endpoint entries accepted by `predicate`
    pub fn count_matching<P>(&self, predicate: P) -> usize
    where
        P: Fn(&StreamEntry<'_>) -> bool,
    {
        let mut count = 0;
        self.for_each_matching(predicate, |_| count += 1);
        count
    }

    /// Streams in the streaming state, across all peers and directions
    #[must_use]
    pub fn streaming_count(&self) -> usize {
        self.count_matching(|entry| entry.stream.state == StreamState::Streaming)
    }

    /// Delays committed by grouped streams, excluding one stream
    ///
    /// Sized for every stream the store can hold, so no tagged stream is left out.
    #[must_use]
    pub fn committed_delays(&self, exclude: StreamRef) -> Vec<CommittedDelay, MAX_STREAMS> {
        let mut committed = Vec::new();
        self.for_each_matching(
            |entry| {
                entry.stream.handle != exclude
                    && entry.stream.group.is_some()
                    && entry.preset.is_configured()
            },
            |entry| {
                if let Some(group) = entry.stream.group {
                    committed
                        .push(CommittedDelay {
                            group,
                            delay_us: entry.preset.presentation_delay_us,
                        })
                        .ok();
                }
            },
        );
        committed
    }

    /// The session's unicast group
    #[must_use]
    pub fn group(&self) -> &UnicastGroup {
        &self.guard.group
    }

    /// Mutable access to the session's unicast group
    pub fn group_mut(&mut self) -> &mut UnicastGroup {
        &mut self.guard.group
    }

    /// Allocate the identity for the next group generation
    pub fn next_group_id(&mut self) -> GroupId {
        let id = self.guard.next_group_id;
        self.guard.next_group_id = id.wrapping_add(1).max(1);
        id
    }

    /// Tag streams with a group generation, or clear tags of a deleted generation
    pub fn tag_group_streams(&mut self, streams: &[StreamRef], group: Option<GroupId>) {
        for slot in self.guard.slots.iter_mut().flatten() {
            for direction in [Direction::Sink, Direction::Source] {
                for stream in &mut slot.direction_mut(direction).streams {
                    if streams.contains(&stream.handle) {
                        stream.group = group;
                    }
                }
            }
        }
    }

    /// Move every configured stream of a group generation to a new delay
    ///
    /// Returns the number of presets updated.
    pub fn retarget_group_delay(&mut self, group: GroupId, delay_us: u32) -> usize {
        let mut updated = 0;
        for slot in self.guard.slots.iter_mut().flatten() {
            for direction in [Direction::Sink, Direction::Source] {
                let state = slot.direction_mut(direction);
                for (preset, stream) in state.presets.iter_mut().zip(state.streams.iter()) {
                    if stream.group == Some(group) && preset.is_configured() {
                        preset.presentation_delay_us = delay_us;
                        updated += 1;
                    }
                }
            }
        }
        if updated > 0 {
            debug!("[STORE] Group {} retargeted to {} us ({} presets)", group, delay_us, updated);
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::peer;

    fn store_with(peers: &[PeerAddress]) -> SessionStore {
        let store = SessionStore::new();
        {
            let mut guard = store.try_lock().unwrap();
            for p in peers {
                guard.add(*p).unwrap();
            }
        }
        store
    }

    #[test]
    fn test_add_uses_lowest_free_slot() {
        let store = store_with(&[peer(1), peer(2), peer(3)]);
        let mut guard = store.try_lock().unwrap();

        guard.remove(&peer(2)).unwrap();
        guard.add(peer(4)).unwrap();
        assert_eq!(guard.get_by_index(1).unwrap().identity(), peer(4));
        assert_eq!(guard.add(peer(1)).err(), Some(UnicastError::AlreadyExists));
    }

    #[test]
    fn test_capacity() {
        let store = store_with(&[peer(1), peer(2), peer(3), peer(4)]);
        let mut guard = store.try_lock().unwrap();
        assert_eq!(guard.add(peer(5)).err(), Some(UnicastError::CapacityExceeded));
    }

    #[test]
    fn test_dense_count() {
        let store = store_with(&[peer(1), peer(2), peer(3)]);
        let mut guard = store.try_lock().unwrap();
        assert_eq!(guard.count(true), Ok(3));

        // Removing the last record leaves the table dense
        guard.remove(&peer(3)).unwrap();
        assert_eq!(guard.count(true), Ok(2));

        // A gap before an occupied slot is reported
        guard.remove(&peer(1)).unwrap();
        assert_eq!(guard.count(false), Ok(1));
        assert_eq!(guard.count(true), Err(UnicastError::NonDense));

        guard.add(peer(5)).unwrap();
        assert_eq!(guard.count(true), Ok(2));
        assert_eq!(guard.remove(&peer(9)), Err(UnicastError::NotFound));
    }

    #[test]
    fn test_dense_count_over_sequences() {
        let store = SessionStore::new();
        let mut guard = store.try_lock().unwrap();
        let ops: [(bool, u8); 10] = [
            (true, 1),
            (true, 2),
            (true, 3),
            (false, 2),
            (true, 4),
            (false, 1),
            (false, 3),
            (true, 5),
            (false, 4),
            (true, 6),
        ];
        let mut live = 0usize;
        for (add, id) in ops {
            if add {
                guard.add(peer(id)).unwrap();
                live += 1;
            } else {
                guard.remove(&peer(id)).unwrap();
                live -= 1;
            }
            assert_eq!(guard.count(false), Ok(live));

            let has_gap = (0..MAX_PEERS).any(|i| {
                guard.get_by_index(i).is_err() && (i + 1..MAX_PEERS).any(|j| guard.get_by_index(j).is_ok())
            });
            assert_eq!(guard.count(true).is_err(), has_gap);
        }
    }

    #[test]
    fn test_readd_yields_fresh_record() {
        let store = store_with(&[peer(1)]);
        let mut guard = store.try_lock().unwrap();
        {
            let record = guard.get_by_identity_mut(&peer(1)).unwrap();
            record.sink.valid_locations = AudioLocation::FRONT_LEFT;
            record
                .sink
                .push_endpoint(EndpointHandle(1), StreamRef(10))
                .unwrap();
            record.set_display_name("LEFT");
        }

        guard.remove(&peer(1)).unwrap();
        let record = guard.add(peer(1)).unwrap();
        assert!(record.sink.is_empty());
        assert_eq!(record.sink.valid_locations, AudioLocation::MONO);
        assert!(record.display_name.is_empty());
        assert_eq!(record.sink.discovery, DiscoveryState::Idle);
    }

    #[test]
    fn test_parallel_arrays_stay_aligned() {
        let mut state = DirectionState::default();
        for i in 0..(MAX_ENDPOINTS as u16 + 2) {
            let result = state.push_endpoint(EndpointHandle(i), StreamRef(100 + i));
            assert_eq!(result.is_ok(), usize::from(i) < MAX_ENDPOINTS);
            assert_eq!(state.endpoints().len(), state.presets().len());
            assert_eq!(state.endpoints().len(), state.streams().len());
        }
        assert_eq!(state.streams()[1].handle, StreamRef(101));

        state.reset();
        assert!(state.is_empty());
        assert!(state.presets().is_empty());
        assert!(state.streams().is_empty());
    }

    #[test]
    fn test_duplicate_stream_ref_is_rejected() {
        let store = store_with(&[peer(1), peer(2)]);
        let mut guard = store.try_lock().unwrap();
        guard
            .get_by_identity_mut(&peer(1))
            .unwrap()
            .sink
            .push_endpoint(EndpointHandle(1), StreamRef(7))
            .unwrap();
        assert!(guard.get_by_stream_ref(StreamRef(7)).is_ok());

        guard
            .get_by_identity_mut(&peer(2))
            .unwrap()
            .sink
            .push_endpoint(EndpointHandle(2), StreamRef(7))
            .unwrap();
        assert_eq!(
            guard.get_by_stream_ref(StreamRef(7)).err(),
            Some(UnicastError::AlreadyExists)
        );
        assert_eq!(
            guard.find_stream(StreamRef(8)).err(),
            Some(UnicastError::NotFound)
        );
    }

    #[test]
    fn test_lookup_by_stream_ref() {
        let store = store_with(&[peer(1)]);
        let mut guard = store.try_lock().unwrap();
        let record = guard.get_by_identity_mut(&peer(1)).unwrap();
        record
            .source
            .push_endpoint(EndpointHandle(1), StreamRef(3))
            .unwrap();
        record
            .source
            .push_endpoint(EndpointHandle(2), StreamRef(4))
            .unwrap();

        let (record, direction, index) = guard.get_by_stream_ref(StreamRef(4)).unwrap();
        assert_eq!(record.identity(), peer(1));
        assert_eq!(direction, Direction::Source);
        assert_eq!(index, 1);
    }

    #[test]
    fn test_clear_requires_idle_streams() {
        let store = store_with(&[peer(1)]);
        let mut guard = store.try_lock().unwrap();
        guard
            .get_by_identity_mut(&peer(1))
            .unwrap()
            .sink
            .push_endpoint(EndpointHandle(1), StreamRef(3))
            .unwrap();
        let position = guard.find_stream(StreamRef(3)).unwrap();
        guard.stream_mut(position).unwrap().state = StreamState::Streaming;
        assert_eq!(guard.streaming_count(), 1);
        assert_eq!(guard.clear(), Err(UnicastError::SessionActive));

        guard.stream_mut(position).unwrap().state = StreamState::Configured;
        assert_eq!(guard.clear(), Ok(()));
        assert_eq!(guard.count(true), Ok(0));
    }

    #[test]
    fn test_lock_timeout() {
        embassy_futures::block_on(async {
            let store = SessionStore::new();
            let _held = store.lock(Duration::from_millis(10)).await.unwrap();
            assert_eq!(
                store.lock(Duration::from_millis(10)).await.err(),
                Some(UnicastError::LockTimeout)
            );
            assert_eq!(store.try_lock().err(), Some(UnicastError::LockTimeout));
        });
    }

    #[test]
    fn test_committed_delays_only_grouped() {
        let store = store_with(&[peer(1)]);
        let mut guard = store.try_lock().unwrap();
        let record = guard.get_by_identity_mut(&peer(1)).unwrap();
        record
            .sink
            .push_endpoint(EndpointHandle(1), StreamRef(1))
            .unwrap();
        record
            .sink
            .push_endpoint(EndpointHandle(2), StreamRef(2))
            .unwrap();
        for index in 0..2 {
            let (preset, _) = record.sink.entry_mut(index).unwrap();
            preset.presentation_delay_us = 2500;
        }
        guard.tag_group_streams(&[StreamRef(1)], Some(4));

        let committed = guard.committed_delays(StreamRef(9));
        assert_eq!(committed.as_slice(), &[CommittedDelay { group: 4, delay_us: 2500 }]);
        assert!(guard.committed_delays(StreamRef(1)).is_empty());
    }

    #[test]
    fn test_committed_delays_cover_full_table() {
        let peers = [peer(1), peer(2), peer(3), peer(4)];
        let store = store_with(&peers);
        let mut guard = store.try_lock().unwrap();
        let mut handle = 0u16;
        let mut streams: Vec<StreamRef, MAX_STREAMS> = Vec::new();
        for p in &peers {
            let record = guard.get_by_identity_mut(p).unwrap();
            for direction in [Direction::Sink, Direction::Source] {
                let state = record.direction_mut(direction);
                for index in 0..MAX_ENDPOINTS {
                    handle += 1;
                    state
                        .push_endpoint(EndpointHandle(handle), StreamRef(handle))
                        .unwrap();
                    state.entry_mut(index).unwrap().0.presentation_delay_us = 3000;
                    streams.push(StreamRef(handle)).unwrap();
                }
            }
        }
        guard.tag_group_streams(&streams, Some(1));

        assert_eq!(guard.committed_delays(StreamRef(0)).len(), MAX_STREAMS);
        assert_eq!(guard.committed_delays(StreamRef(1)).len(), MAX_STREAMS - 1);
    }

    #[test]
    fn test_retarget_group_delay() {
        let store = store_with(&[peer(1)]);
        let mut guard = store.try_lock().unwrap();
        let record = guard.get_by_identity_mut(&peer(1)).unwrap();
        for i in 0..3u16 {
            record
                .sink
                .push_endpoint(EndpointHandle(i), StreamRef(i))
                .unwrap();
        }
        for index in 0..2 {
            let (preset, _) = record.sink.entry_mut(index).unwrap();
            preset.presentation_delay_us = 2500;
        }
        guard.tag_group_streams(&[StreamRef(0), StreamRef(2)], Some(2));

        // Stream 2 is tagged but not configured, stream 1 is configured but untagged
        assert_eq!(guard.retarget_group_delay(2, 1000), 1);
        let presets = guard.get_by_identity(&peer(1)).unwrap().sink.presets();
        assert_eq!(presets[0].presentation_delay_us, 1000);
        assert_eq!(presets[1].presentation_delay_us, 2500);
        assert_eq!(presets[2].presentation_delay_us, 0);
    }
}

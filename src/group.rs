//! Unicast Group and Pairing Builder
//!
//! A session runs at most one isochronous group. Its members pair a sink stream
//! (host transmits) with an optional source stream (host receives) of the same
//! peer. The builder reads the session store and produces the candidate member
//! list for a group creation or a membership check.

use crate::{
    Direction, GroupId, PeerAddress, StreamRef, UnicastError,
    audio::QosPreference,
    constants::{MAX_GROUP_MEMBERS, MAX_PROCEDURE_STREAMS},
    presentation_delay,
    store::{StoreGuard, StreamState},
};
use heapless::Vec;

/// Lifecycle of the unicast group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GroupLifecycle {
    /// No group exists
    #[default]
    Absent,
    /// Group creation submitted to the transport
    Creating,
    /// Group exists
    Created,
    /// Members are being released; the group is rebuilt once all are idle
    PendingRecreate,
    /// Group deletion submitted to the transport
    Deleting,
}

/// CIS packing used for the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Packing {
    /// Streams scheduled one after another
    #[default]
    Sequential,
    /// Streams interleaved
    Interleaved,
}

/// One member of the group: a sink stream and an optional paired source stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GroupMember {
    /// Stream the host transmits on (peer sink)
    pub tx: StreamRef,
    /// Stream the host receives on (peer source), same peer as `tx`
    pub rx: Option<StreamRef>,
}

/// Group creation parameters handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupParams<'a> {
    /// Group identity
    pub id: GroupId,
    /// Members in pairing order
    pub members: &'a [GroupMember],
    /// Group-wide presentation delay in microseconds
    pub presentation_delay_us: u32,
    /// Packing mode
    pub packing: Packing,
}

/// A candidate member together with what the builder learned about it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCandidate {
    /// Proposed member
    pub member: GroupMember,
    /// Peer both streams belong to
    pub peer: PeerAddress,
    /// QoS preference of the sink stream
    pub tx_qos: QosPreference,
    /// QoS preference of the source stream, if paired
    pub rx_qos: Option<QosPreference>,
}

/// Candidate list produced by [`build_candidates`]
pub type Candidates = Vec<GroupCandidate, MAX_GROUP_MEMBERS>;

/// The session's unicast group
#[derive(Debug, Clone)]
pub struct UnicastGroup {
    id: Option<GroupId>,
    members: Vec<GroupMember, MAX_GROUP_MEMBERS>,
    /// Delay shared by every member
    pub presentation_delay_us: u32,
    /// Current lifecycle
    pub lifecycle: GroupLifecycle,
    /// Packing used at creation
    pub packing: Packing,
    /// A member's delay moved; streaming members must be retargeted
    pub reconfig_pending: bool,
}

impl UnicastGroup {
    /// Create an absent group
    #[must_use]
    pub const fn new() -> Self {
        Self {
            id: None,
            members: Vec::new(),
            presentation_delay_us: 0,
            lifecycle: GroupLifecycle::Absent,
            packing: Packing::Sequential,
            reconfig_pending: false,
        }
    }

    /// Identity of the current group generation
    #[must_use]
    pub const fn id(&self) -> Option<GroupId> {
        self.id
    }

    /// Members in pairing order
    #[must_use]
    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    /// Whether a group currently exists at the transport
    #[must_use]
    pub const fn exists(&self) -> bool {
        !matches!(self.lifecycle, GroupLifecycle::Absent)
    }

    /// Populate the group from candidates; lifecycle moves to `Creating`
    pub fn assign(
        &mut self,
        id: GroupId,
        candidates: &[GroupCandidate],
        presentation_delay_us: u32,
        packing: Packing,
    ) {
        self.id = Some(id);
        self.members = candidates.iter().map(|c| c.member).collect();
        self.presentation_delay_us = presentation_delay_us;
        self.packing = packing;
        self.lifecycle = GroupLifecycle::Creating;
        self.reconfig_pending = false;
    }

    /// Transport parameters for the current members
    #[must_use]
    pub fn params(&self) -> Option<GroupParams<'_>> {
        Some(GroupParams {
            id: self.id?,
            members: &self.members,
            presentation_delay_us: self.presentation_delay_us,
            packing: self.packing,
        })
    }

    /// Check whether a stream is part of the group
    #[must_use]
    pub fn contains(&self, stream: StreamRef) -> bool {
        self.members
            .iter()
            .any(|m| m.tx == stream || m.rx == Some(stream))
    }

    /// Every candidate's streams are already members
    #[must_use]
    pub fn covers(&self, candidates: &[GroupCandidate]) -> bool {
        candidates.iter().all(|c| {
            self.contains(c.member.tx) && c.member.rx.is_none_or(|rx| self.contains(rx))
        })
    }

    /// All member streams, transmit side first within each member
    #[must_use]
    pub fn streams(&self) -> Vec<StreamRef, MAX_PROCEDURE_STREAMS> {
        let mut streams = Vec::new();
        for member in &self.members {
            streams.push(member.tx).ok();
            if let Some(rx) = member.rx {
                streams.push(rx).ok();
            }
        }
        streams
    }

    /// Forget the group; lifecycle returns to `Absent`
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for UnicastGroup {
    fn default() -> Self {
        Self::new()
    }
}

struct Side {
    peer: PeerAddress,
    stream: StreamRef,
    qos: QosPreference,
}

/// Collect configured, not-yet-streaming endpoints and pair them.
///
/// Sink entries are paired, in order, with the first unpaired source entry of
/// the same peer. Sinks without a match become sink-only members; sources
/// without a matching sink are left out.
#[must_use]
pub fn build_candidates(store: &StoreGuard<'_>) -> Candidates {
    let mut sinks: Vec<Side, MAX_GROUP_MEMBERS> = Vec::new();
    let mut sources: Vec<(Side, bool), MAX_GROUP_MEMBERS> = Vec::new();

    store.for_each_matching(
        |entry| {
            entry.preset.is_configured()
                && !matches!(
                    entry.stream.state,
                    StreamState::Streaming | StreamState::Stopping
                )
        },
        |entry| {
            let side = Side {
                peer: entry.peer,
                stream: entry.stream.handle,
                qos: entry.preset.qos,
            };
            let pushed = match entry.direction {
                Direction::Sink => sinks.push(side).is_ok(),
                Direction::Source => sources.push((side, false)).is_ok(),
            };
            if !pushed {
                warn!("[GROUP] Candidate list full, dropping {}", entry.stream.handle);
            }
        },
    );

    let mut candidates = Candidates::new();
    for sink in &sinks {
        let rx = sources
            .iter_mut()
            .find(|(source, paired)| !paired && source.peer == sink.peer)
            .map(|(source, paired)| {
                *paired = true;
                (source.stream, source.qos)
            });
        let candidate = GroupCandidate {
            member: GroupMember {
                tx: sink.stream,
                rx: rx.map(|(stream, _)| stream),
            },
            peer: sink.peer,
            tx_qos: sink.qos,
            rx_qos: rx.map(|(_, qos)| qos),
        };
        if candidates.push(candidate).is_err() {
            break;
        }
    }

    for (source, paired) in &sources {
        if !paired {
            debug!(
                "[GROUP] Source stream {} of {} has no sink to pair with",
                source.stream, source.peer
            );
        }
    }

    candidates
}

/// Group-wide delay for a set of candidates
///
/// # Errors
///
/// Returns `UnicastError::NoValidDelay` if no single delay satisfies every
/// candidate stream.
pub fn candidates_delay(candidates: &[GroupCandidate]) -> Result<u32, UnicastError> {
    let mut preferences: Vec<QosPreference, MAX_PROCEDURE_STREAMS> = Vec::new();
    for candidate in candidates {
        preferences.push(candidate.tx_qos).ok();
        if let Some(rx_qos) = candidate.rx_qos {
            preferences.push(rx_qos).ok();
        }
    }
    presentation_delay::group_delay(preferences.iter())
}

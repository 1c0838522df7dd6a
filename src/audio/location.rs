//! Channel-location assignment
//!
//! Maps the audio locations a peer reported for one direction onto the
//! allocation each of its endpoints should carry.

use super::{AudioLocation, CodecCapability};
use crate::UnicastError;
use heapless::Vec;

/// How a direction's audio channels are spread over the peer's endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelAssignment {
    /// One stream without a location
    Mono,
    /// One front-left stream
    Left,
    /// One front-right stream
    Right,
    /// One two-channel stream carrying front left and front right
    Stereo,
    /// Two single-channel streams, front left then front right
    StereoSplit,
}

impl ChannelAssignment {
    /// Allocation for each endpoint to configure, in endpoint order
    #[must_use]
    pub fn allocations(self) -> Vec<AudioLocation, 2> {
        let mut allocations = Vec::new();
        match self {
            Self::Mono => allocations.push(AudioLocation::MONO).ok(),
            Self::Left => allocations.push(AudioLocation::FRONT_LEFT).ok(),
            Self::Right => allocations.push(AudioLocation::FRONT_RIGHT).ok(),
            Self::Stereo => allocations.push(AudioLocation::STEREO).ok(),
            Self::StereoSplit => {
                allocations.push(AudioLocation::FRONT_LEFT).ok();
                allocations.push(AudioLocation::FRONT_RIGHT).ok()
            }
        };
        allocations
    }

    /// Diagnostic label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Mono => "MONO",
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
            Self::Stereo | Self::StereoSplit => "STEREO",
        }
    }
}

/// Decide the channel assignment for one direction of a peer.
///
/// No location bits means mono. Both front locations mean stereo: a
/// two-channel stream when the capability allows two channels per stream,
/// two streams when the peer exposes two endpoints, and left-only otherwise.
/// Any other left-side location selects the left channel, and failing that
/// any right-side location selects the right channel.
///
/// # Errors
///
/// Returns `UnicastError::NoValidConfig` if no left or right location is
/// present, if the capability cannot carry a single channel, or if there is
/// no endpoint to configure.
pub fn assign_channels(
    locations: AudioLocation,
    capability: &CodecCapability,
    endpoint_count: usize,
) -> Result<ChannelAssignment, UnicastError> {
    if endpoint_count == 0 {
        return Err(UnicastError::NoValidConfig);
    }

    let assignment = if locations == AudioLocation::MONO {
        ChannelAssignment::Mono
    } else if locations.contains(AudioLocation::STEREO) {
        if capability.channel_counts.supports(2) {
            return Ok(ChannelAssignment::Stereo);
        } else if endpoint_count >= 2 {
            ChannelAssignment::StereoSplit
        } else {
            ChannelAssignment::Left
        }
    } else if locations.intersects(AudioLocation::LEFT_FAMILY) {
        ChannelAssignment::Left
    } else if locations.intersects(AudioLocation::RIGHT_FAMILY) {
        ChannelAssignment::Right
    } else {
        return Err(UnicastError::NoValidConfig);
    };

    if capability.channel_counts.supports(1) {
        Ok(assignment)
    } else {
        Err(UnicastError::NoValidConfig)
    }
}

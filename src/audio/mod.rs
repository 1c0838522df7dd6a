//! LE Audio codec, QoS and channel-location types
//!
//! This module holds the value types exchanged with the transport during
//! endpoint discovery and stream configuration:
//!
//! - **Codec**: LC3 capability records advertised by a peer and the codec
//!   configuration applied to an endpoint
//! - **QoS**: the peer's preferred QoS, including presentation delay ranges
//! - **Location**: audio channel location bitmasks and the channel assignment
//!   rule that maps a peer's locations onto endpoints

pub mod codec;
pub mod location;

pub use codec::*;
pub use location::*;

/// Audio channel location bitmask (Bluetooth Assigned Numbers, Audio Location)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AudioLocation(pub u32);

impl AudioLocation {
    /// Mono audio, no specified location
    pub const MONO: Self = Self(0x0000_0000);
    /// Front left
    pub const FRONT_LEFT: Self = Self(0x0000_0001);
    /// Front right
    pub const FRONT_RIGHT: Self = Self(0x0000_0002);
    /// Front center
    pub const FRONT_CENTER: Self = Self(0x0000_0004);
    /// Low frequency effects 1
    pub const LOW_FREQ_EFFECTS_1: Self = Self(0x0000_0008);
    /// Back left
    pub const BACK_LEFT: Self = Self(0x0000_0010);
    /// Back right
    pub const BACK_RIGHT: Self = Self(0x0000_0020);
    /// Side left
    pub const SIDE_LEFT: Self = Self(0x0000_0400);
    /// Right surround
    pub const RIGHT_SURROUND: Self = Self(0x0800_0000);
    /// Front left and front right
    pub const STEREO: Self = Self(0x0000_0003);
    /// Every left-side location: front, back, front of center, side, top
    /// front/back/side, bottom front, front wide and surround
    pub const LEFT_FAMILY: Self = Self(0x0545_1451);
    /// Every right-side location, mirroring [`Self::LEFT_FAMILY`]
    pub const RIGHT_FAMILY: Self = Self(0x0A8A_28A2);
    /// Every location bit defined by the assigned numbers
    pub const SUPPORTED: Self = Self(0x0FFF_FFFF);

    /// Check whether all bits of `other` are set
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether any bit of `other` is set
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Check whether this mask only uses defined location bits
    #[must_use]
    pub const fn is_supported(self) -> bool {
        self.0 & !Self::SUPPORTED.0 == 0
    }

    /// Number of channels described by this mask (mono counts as one)
    #[must_use]
    pub const fn channel_count(self) -> u8 {
        if self.0 == 0 {
            1
        } else {
            self.0.count_ones() as u8
        }
    }
}

/// Audio context bitmask (Bluetooth Assigned Numbers, Context Type)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AudioContexts(pub u16);

impl AudioContexts {
    /// No context
    pub const PROHIBITED: Self = Self(0x0000);
    /// Unspecified
    pub const UNSPECIFIED: Self = Self(0x0001);
    /// Conversational (telephony, video calls)
    pub const CONVERSATIONAL: Self = Self(0x0002);
    /// Media (music, video soundtrack)
    pub const MEDIA: Self = Self(0x0004);
    /// Game audio
    pub const GAME: Self = Self(0x0008);
    /// Live audio
    pub const LIVE: Self = Self(0x0040);

    /// Check whether any bit of `other` is set
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// One interval of PCM-encoded or codec-encoded audio, channel blocks back to back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFrame<'a> {
    /// Channel blocks of equal length, channel 0 first
    pub data: &'a [u8],
    /// Number of channel blocks in `data`
    pub channels: u8,
}

impl<'a> AudioFrame<'a> {
    /// Frame holding a single channel
    #[must_use]
    pub const fn mono(data: &'a [u8]) -> Self {
        Self { data, channels: 1 }
    }

    /// Block of one channel, if present
    #[must_use]
    pub fn block(&self, channel: u8) -> Option<&'a [u8]> {
        if channel >= self.channels {
            return None;
        }
        let len = self.data.len() / usize::from(self.channels);
        let start = usize::from(channel) * len;
        self.data.get(start..start + len)
    }
}

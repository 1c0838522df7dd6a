//! LC3 Codec Capabilities, Configuration and QoS Preferences
//!
//! Capabilities are what a peer advertises for one direction (a PAC record);
//! a configuration is what this host applies to one endpoint. A `Preset` bundles
//! the applied configuration with the QoS preference the peer returned and the
//! presentation delay this host committed to.

use super::AudioLocation;
use crate::constants::LC3_CODEC_ID;

/// Supported LC3 sampling frequencies bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SamplingFrequencies(pub u16);

impl SamplingFrequencies {
    /// 8 kHz
    pub const HZ_8000: u16 = 0x0001;
    /// 16 kHz
    pub const HZ_16000: u16 = 0x0004;
    /// 24 kHz
    pub const HZ_24000: u16 = 0x0010;
    /// 32 kHz
    pub const HZ_32000: u16 = 0x0020;
    /// 44.1 kHz
    pub const HZ_44100: u16 = 0x0040;
    /// 48 kHz
    pub const HZ_48000: u16 = 0x0080;

    /// Map a sample rate in Hz onto its capability bit
    #[must_use]
    pub const fn bit_for(hz: u32) -> Option<u16> {
        match hz {
            8_000 => Some(Self::HZ_8000),
            16_000 => Some(Self::HZ_16000),
            24_000 => Some(Self::HZ_24000),
            32_000 => Some(Self::HZ_32000),
            44_100 => Some(Self::HZ_44100),
            48_000 => Some(Self::HZ_48000),
            _ => None,
        }
    }

    /// Check if a sample rate in Hz is supported
    #[must_use]
    pub const fn supports_hz(self, hz: u32) -> bool {
        match Self::bit_for(hz) {
            Some(bit) => self.0 & bit != 0,
            None => false,
        }
    }
}

/// Supported LC3 frame durations bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameDurations(pub u8);

impl FrameDurations {
    /// 7.5 ms frames
    pub const MS_7_5: u8 = 0x01;
    /// 10 ms frames
    pub const MS_10: u8 = 0x02;

    /// Check if a frame duration in microseconds is supported
    #[must_use]
    pub const fn supports_us(self, duration_us: u32) -> bool {
        match duration_us {
            7_500 => self.0 & Self::MS_7_5 != 0,
            10_000 => self.0 & Self::MS_10 != 0,
            _ => false,
        }
    }
}

/// Supported audio channel counts bitmask (bit n-1 set means n channels)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelCounts(pub u8);

impl ChannelCounts {
    /// Check if `count` channels per stream are supported
    ///
    /// An empty mask means the capability did not specify counts, which
    /// defaults to a single channel.
    #[must_use]
    pub const fn supports(self, count: u8) -> bool {
        if count == 0 || count > 8 {
            return false;
        }
        if self.0 == 0 {
            return count == 1;
        }
        self.0 & (1 << (count - 1)) != 0
    }
}

/// Codec capability record advertised by a peer for one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CodecCapability {
    /// Coding format
    pub codec_id: u8,
    /// Supported sampling frequencies
    pub frequencies: SamplingFrequencies,
    /// Supported frame durations
    pub durations: FrameDurations,
    /// Supported channel counts per stream
    pub channel_counts: ChannelCounts,
    /// Minimum octets per codec frame
    pub octets_per_frame_min: u16,
    /// Maximum octets per codec frame
    pub octets_per_frame_max: u16,
    /// Maximum codec frames per SDU
    pub max_frames_per_sdu: u8,
}

impl CodecCapability {
    /// LC3 capability covering the common unicast presets
    #[must_use]
    pub const fn lc3_default() -> Self {
        Self {
            codec_id: LC3_CODEC_ID,
            frequencies: SamplingFrequencies(
                SamplingFrequencies::HZ_16000
                    | SamplingFrequencies::HZ_24000
                    | SamplingFrequencies::HZ_48000,
            ),
            durations: FrameDurations(FrameDurations::MS_10),
            channel_counts: ChannelCounts(0x01),
            octets_per_frame_min: 40,
            octets_per_frame_max: 120,
            max_frames_per_sdu: 1,
        }
    }

    /// Check whether a configuration can be applied to an endpoint with this capability
    #[must_use]
    pub const fn supports(&self, config: &CodecConfig) -> bool {
        self.codec_id == config.codec_id
            && self.frequencies.supports_hz(config.sampling_frequency_hz)
            && self.durations.supports_us(config.frame_duration_us)
            && config.octets_per_frame >= self.octets_per_frame_min
            && config.octets_per_frame <= self.octets_per_frame_max
            && (self.max_frames_per_sdu == 0 || config.frames_per_sdu <= self.max_frames_per_sdu)
    }
}

/// Codec configuration applied to one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CodecConfig {
    /// Coding format
    pub codec_id: u8,
    /// Sample rate in Hz
    pub sampling_frequency_hz: u32,
    /// Frame duration in microseconds
    pub frame_duration_us: u32,
    /// Octets per codec frame (per channel)
    pub octets_per_frame: u16,
    /// Codec frames per SDU
    pub frames_per_sdu: u8,
    /// Channel allocation carried by this stream
    pub channel_allocation: AudioLocation,
}

impl CodecConfig {
    /// LC3 16 kHz, 10 ms, 40 octets (BAP preset 16_2_1)
    #[must_use]
    pub const fn lc3_16_2_1() -> Self {
        Self::lc3(16_000, 40)
    }

    /// LC3 24 kHz, 10 ms, 60 octets (BAP preset 24_2_1)
    #[must_use]
    pub const fn lc3_24_2_1() -> Self {
        Self::lc3(24_000, 60)
    }

    /// LC3 48 kHz, 10 ms, 120 octets (BAP preset 48_4_1)
    #[must_use]
    pub const fn lc3_48_4_1() -> Self {
        Self::lc3(48_000, 120)
    }

    const fn lc3(sampling_frequency_hz: u32, octets_per_frame: u16) -> Self {
        Self {
            codec_id: LC3_CODEC_ID,
            sampling_frequency_hz,
            frame_duration_us: 10_000,
            octets_per_frame,
            frames_per_sdu: 1,
            channel_allocation: AudioLocation::MONO,
        }
    }

    /// Return a copy carrying the given channel allocation
    #[must_use]
    pub const fn with_allocation(mut self, allocation: AudioLocation) -> Self {
        self.channel_allocation = allocation;
        self
    }

    /// Bitrate of one channel in bits per second
    #[must_use]
    pub const fn bitrate(&self) -> u32 {
        if self.frame_duration_us == 0 {
            return 0;
        }
        (self.octets_per_frame as u32) * 8 * 1_000_000 / self.frame_duration_us
    }

    /// SDU length for one interval, all channels of the allocation included
    #[must_use]
    pub const fn sdu_length(&self) -> usize {
        (self.octets_per_frame as usize)
            * (self.frames_per_sdu as usize)
            * (self.channel_allocation.channel_count() as usize)
    }
}

/// QoS preference returned by a peer after codec configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QosPreference {
    /// Unframed PDUs supported
    pub unframed_supported: bool,
    /// Preferred PHY bitmask
    pub phy: u8,
    /// Preferred retransmission number
    pub rtn: u8,
    /// Maximum transport latency in milliseconds
    pub max_latency_ms: u16,
    /// Minimum supported presentation delay in microseconds
    pub pd_min_us: u32,
    /// Maximum supported presentation delay in microseconds
    pub pd_max_us: u32,
    /// Preferred minimum presentation delay in microseconds (0 = none)
    pub pref_pd_min_us: u32,
    /// Preferred maximum presentation delay in microseconds (0 = none)
    pub pref_pd_max_us: u32,
}

impl QosPreference {
    /// Preference carrying only presentation delay bounds
    #[must_use]
    pub const fn with_delay(pd_min_us: u32, pd_max_us: u32, pref_min_us: u32, pref_max_us: u32) -> Self {
        Self {
            unframed_supported: true,
            phy: 0x02,
            rtn: 2,
            max_latency_ms: 10,
            pd_min_us,
            pd_max_us,
            pref_pd_min_us: pref_min_us,
            pref_pd_max_us: pref_max_us,
        }
    }

    /// Check whether a delay lies in the supported `[pd_min, pd_max]` range
    #[must_use]
    pub const fn accepts(&self, delay_us: u32) -> bool {
        delay_us >= self.pd_min_us && delay_us <= self.pd_max_us
    }
}

/// Codec configuration and QoS bundle associated with one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Preset {
    /// Applied codec configuration
    pub config: CodecConfig,
    /// QoS preference reported by the peer
    pub qos: QosPreference,
    /// Committed presentation delay in microseconds (0 until configured)
    pub presentation_delay_us: u32,
}

impl Preset {
    /// A preset is complete once a presentation delay has been committed
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.presentation_delay_us != 0
    }
}

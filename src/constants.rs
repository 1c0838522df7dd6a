//! `Cisbird` Constants
//!
//! This module contains the capacities, defaults and Bluetooth LE Audio assigned
//! numbers used throughout the `Cisbird` library. Every bounded table in the crate
//! is sized by one of the constants below.

/// Maximum number of peers tracked by the session store
pub const MAX_PEERS: usize = 4;

/// Maximum number of remote endpoints per peer and direction
pub const MAX_ENDPOINTS: usize = 4;

/// Maximum number of codec capability records per peer and direction
pub const MAX_CODEC_CAPABILITIES: usize = 4;

/// Maximum number of members in the unicast group
pub const MAX_GROUP_MEMBERS: usize = MAX_PEERS * MAX_ENDPOINTS;

/// Maximum number of streams across every peer and direction
pub const MAX_STREAMS: usize = 2 * MAX_PEERS * MAX_ENDPOINTS;

/// Maximum number of streams addressed by one procedure
pub const MAX_PROCEDURE_STREAMS: usize = MAX_STREAMS;

/// Depth of the inbound transport event queue
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Depth of the outward session event channel
pub const SESSION_EVENT_DEPTH: usize = 8;

/// Depth of the serialized work queue
pub const WORK_QUEUE_DEPTH: usize = 4;

/// Maximum length of a record's diagnostic label
pub const MAX_DISPLAY_NAME_LENGTH: usize = 16;

/// Default store lock acquisition budget in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 500;

/// Default procedure gate acquisition budget in milliseconds
pub const DEFAULT_GATE_TIMEOUT_MS: u64 = 2000;

/// LC3 coding format identifier
pub const LC3_CODEC_ID: u8 = 0x06;

/// Maximum payload handed to the transport for one stream in one call
pub const MAX_SDU_LENGTH: usize = 240;

//! Presentation Delay Resolver
//!
//! Presentation delay is a group-wide property: every stream of an isochronous
//! group must render at the same delay. Each time a stream finishes codec
//! configuration the peer reports the range it supports, and this module picks
//! the delay the stream will use given whatever its group has already committed to.
//!
//! The computation is pure. The caller collects the delays already committed by
//! other streams from the session store and passes them in.

use crate::{GroupId, UnicastError, audio::QosPreference};

/// Delay committed by a stream that belongs to a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommittedDelay {
    /// Group the committing stream belongs to
    pub group: GroupId,
    /// Committed presentation delay in microseconds
    pub delay_us: u32,
}

/// Outcome of a presentation delay resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DelayResolution {
    /// Delay the new stream must use
    pub computed_delay_us: u32,
    /// Delay previously committed by the group, if any
    pub previous_delay_us: Option<u32>,
    /// Streams already committed to the previous delay must be retargeted
    pub group_reconfig_needed: bool,
}

/// Resolve the delay for a stream against a single committed group delay.
///
/// # Errors
///
/// Returns `UnicastError::NoValidDelay` if nothing is committed and the
/// stream reports neither a preferred minimum nor a minimum delay.
pub fn resolve_against(
    qos: &QosPreference,
    committed: Option<u32>,
) -> Result<DelayResolution, UnicastError> {
    match committed {
        None => {
            let candidate = if qos.pref_pd_min_us != 0 {
                qos.pref_pd_min_us
            } else {
                qos.pd_min_us
            };
            if candidate == 0 {
                return Err(UnicastError::NoValidDelay);
            }
            Ok(DelayResolution {
                computed_delay_us: candidate,
                previous_delay_us: None,
                group_reconfig_needed: false,
            })
        }
        Some(current) if qos.accepts(current) => Ok(DelayResolution {
            computed_delay_us: current,
            previous_delay_us: Some(current),
            group_reconfig_needed: false,
        }),
        Some(current) => {
            if qos.pd_min_us == 0 {
                return Err(UnicastError::NoValidDelay);
            }
            Ok(DelayResolution {
                computed_delay_us: qos.pd_min_us,
                previous_delay_us: Some(current),
                group_reconfig_needed: true,
            })
        }
    }
}

/// Resolve the delay for a stream, restricted to the group it belongs to.
///
/// With a `target` group only delays committed to that group count. Without
/// one, delays from any group count, but they must all come from a single
/// group identity.
///
/// # Errors
///
/// Returns `UnicastError::MultiGroupConflict` if the stream has no group and the
/// committed delays span more than one group identity, and
/// `UnicastError::NoValidDelay` as described in [`resolve_against`].
pub fn resolve(
    qos: &QosPreference,
    target: Option<GroupId>,
    committed: &[CommittedDelay],
) -> Result<DelayResolution, UnicastError> {
    let mut relevant = committed
        .iter()
        .filter(|entry| target.is_none_or(|group| entry.group == group));

    let current = match relevant.next() {
        Some(first) => {
            if relevant.any(|entry| entry.group != first.group) {
                warn!(
                    "[DELAY] Committed delays span groups {} and others",
                    first.group
                );
                return Err(UnicastError::MultiGroupConflict);
            }
            Some(first.delay_us)
        }
        None => None,
    };

    let resolution = resolve_against(qos, current)?;
    debug!(
        "[DELAY] Resolved {} us (previous {:?}, reconfig {})",
        resolution.computed_delay_us,
        resolution.previous_delay_us,
        resolution.group_reconfig_needed
    );
    Ok(resolution)
}

/// Fold the resolver over every stream of a group being created.
///
/// # Errors
///
/// Returns `UnicastError::NoValidDelay` if the folded delay lies outside any
/// stream's supported range, or if `preferences` is empty.
pub fn group_delay<'a, I>(preferences: I) -> Result<u32, UnicastError>
where
    I: IntoIterator<Item = &'a QosPreference> + Clone,
{
    let mut committed = None;
    for qos in preferences.clone() {
        committed = Some(resolve_against(qos, committed)?.computed_delay_us);
    }
    let delay = committed.ok_or(UnicastError::NoValidDelay)?;
    if preferences.into_iter().all(|qos| qos.accepts(delay)) {
        Ok(delay)
    } else {
        Err(UnicastError::NoValidDelay)
    }
}

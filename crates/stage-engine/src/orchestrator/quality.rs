//! Advisory network quality, derived from peer transport statistics.

use crate::types::{LinkQuality, NetworkQuality};

/// Round-trip time below which quality is `Good`.
pub const GOOD_RTT_CEILING_MS: u32 = 150;

/// Round-trip time below which quality is `Degraded` (and above which it is
/// `Poor`).
pub const DEGRADED_RTT_CEILING_MS: u32 = 400;

/// Average connected-link round-trip time bucketed into a quality level.
///
/// With no connected links there is nothing to measure; reports `Good` with
/// zero ping rather than alarming on an empty stage.
#[must_use]
pub(crate) fn derive_quality(rtts_ms: &[u32]) -> NetworkQuality {
    if rtts_ms.is_empty() {
        return NetworkQuality::default();
    }
    let sum: u64 = rtts_ms.iter().map(|rtt| u64::from(*rtt)).sum();
    let count = rtts_ms.len() as u64;
    let average = sum / count;
    let ping_ms = u32::try_from(average).unwrap_or(u32::MAX);

    let quality = if ping_ms < GOOD_RTT_CEILING_MS {
        LinkQuality::Good
    } else if ping_ms < DEGRADED_RTT_CEILING_MS {
        LinkQuality::Degraded
    } else {
        LinkQuality::Poor
    };
    NetworkQuality { quality, ping_ms }
}

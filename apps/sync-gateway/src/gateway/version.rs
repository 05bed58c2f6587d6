//! Client version negotiation.
//!
//! Pure functions: a client-reported version string decides (a) whether the
//! client may connect at all and (b) which broadcast wire format it gets.
//! Canary builds carry a `canary.<YYYYMMDD>` pre-release marker and are
//! pinned to a fixed effective version before the range checks run.

use chrono::NaiveDate;
use semver::Version;

/// Oldest client version still admitted.
const MIN_SUPPORTED: (u64, u64, u64) = (0, 20, 0);

/// Clients at or above this version speak the batched/compressible format.
const MIN_CURRENT_PROTOCOL: (u64, u64, u64) = (0, 26, 0);

/// Effective version substituted for an accepted canary marker.
const CANARY_PINNED: (u64, u64, u64) = (0, 26, 0);

/// Canary builds older than this date are rejected outright.
const CANARY_FLOOR: (i32, u32, u32) = (2025, 6, 1);

/// The broadcast room a negotiated client belongs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolRoom {
    /// One message per update.
    Legacy,
    /// Batched, optionally compressed.
    Current,
}

/// Negotiate a client version string. `None` means unsupported and the
/// caller must reject the join.
pub fn negotiate(client_version: &str) -> Option<ProtocolRoom> {
    let version = effective_version(client_version)?;
    if version < mk(MIN_SUPPORTED) {
        return None;
    }
    if version >= mk(MIN_CURRENT_PROTOCOL) {
        Some(ProtocolRoom::Current)
    } else {
        Some(ProtocolRoom::Legacy)
    }
}

pub fn is_supported(client_version: &str) -> bool {
    negotiate(client_version).is_some()
}

fn mk((major, minor, patch): (u64, u64, u64)) -> Version {
    Version::new(major, minor, patch)
}

/// Resolve the version the range checks should run against.
///
/// An accepted canary marker substitutes the pinned version; a canary marker
/// that fails its date check disqualifies the client no matter what the
/// literal version number says.
fn effective_version(raw: &str) -> Option<Version> {
    let version = Version::parse(raw.trim()).ok()?;
    if let Some(date) = version.pre.as_str().strip_prefix("canary.") {
        return canary_effective(date);
    }
    Some(version)
}

fn canary_effective(date: &str) -> Option<Version> {
    let parsed = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    let (year, month, day) = CANARY_FLOOR;
    let floor = NaiveDate::from_ymd_opt(year, month, day)?;
    if parsed < floor {
        return None;
    }
    Some(mk(CANARY_PINNED))
}

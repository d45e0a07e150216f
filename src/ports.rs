//! Port allocation for version workers

use crate::config::PortRange;
use crate::error::{Error, Result};
use std::collections::BTreeSet;

/// Return the first port in the range not present in `used`.
///
/// Ports recorded in the meta state for still-present versions are always in
/// `used` before this is called, so an instance keeps its port across
/// reconciliations.
pub fn allocate(used: &BTreeSet<u16>, range: PortRange) -> Result<u16> {
    (range.min..=range.max)
        .find(|port| !used.contains(port))
        .ok_or(Error::PortRangeExhausted {
            min: range.min,
            max: range.max,
        })
}

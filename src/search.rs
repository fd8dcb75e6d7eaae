//! Locating identifier-range boundaries in the remote log collection.
//!
//! Identifiers are dense positive integers assigned in creation order, so the
//! date of the first log event is non-decreasing across identifiers. That
//! ordering is what makes both searches here valid; it is a precondition, not
//! something we can detect.

use anyhow::Result;
use jiff::civil::Date;

use crate::api::{parse_events, LogSource};

/// Starting point of the doubling probe in [`find_upper_bound`].
const PROBE_START: u64 = 1000;

/// Which end of a run of equal dates to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Lower,
    Upper,
}

async fn has_data<S: LogSource + ?Sized>(source: &S, id: u64) -> Result<bool> {
    Ok(!parse_events(&source.get_log(id).await?)?.is_empty())
}

/// Creation date of the record at `id`, or `None` when the identifier has no
/// events (a gap, or past the end of the collection).
pub async fn timestamp<S: LogSource + ?Sized>(source: &S, id: u64) -> Result<Option<Date>> {
    if id == 0 {
        return Ok(None);
    }
    let events = parse_events(&source.get_log(id).await?)?;
    match events.first() {
        Some(event) => Ok(Some(event.date()?)),
        None => Ok(None),
    }
}

/// Largest identifier that still has data: double an exclusive probe until it
/// falls off the end of the collection, then binary-search for the boundary
/// where `mid` has data and `mid + 1` does not. `None` means the collection
/// is empty.
pub async fn find_upper_bound<S: LogSource + ?Sized>(source: &S) -> Result<Option<u64>> {
    let mut high = PROBE_START;
    while has_data(source, high).await? {
        high *= 2;
    }

    let mut low = 1u64;
    while low <= high {
        let mid = low + (high - low) / 2;
        if !has_data(source, mid).await? {
            high = mid - 1;
        } else if !has_data(source, mid + 1).await? {
            return Ok(Some(mid));
        } else {
            low = mid + 1;
        }
    }
    Ok(None)
}

/// Binary search over `[1, end_index]` for the first (`Bound::Lower`) or last
/// (`Bound::Upper`) identifier whose record date equals `target`. Midpoints
/// that land on a gap scan forward to the next identifier with data; the scan
/// stops at `end_index`, which keeps it bounded but means tie-breaking next
/// to a long run of gaps is only as good as the dense-identifier assumption.
/// `None` when no record carries the target date.
pub async fn date_search<S: LogSource + ?Sized>(
    source: &S,
    end_index: u64,
    target: Date,
    bound: Bound,
) -> Result<Option<u64>> {
    let mut low = 1u64;
    let mut high = end_index;

    while low <= high {
        let probe = low + (high - low) / 2;

        // skip forward past identifiers with no events
        let mut mid = probe;
        let mut cur = None;
        while mid <= end_index {
            if let Some(date) = timestamp(source, mid).await? {
                cur = Some(date);
                break;
            }
            mid += 1;
        }
        let Some(cur) = cur else {
            // nothing but gaps from the probe onward
            high = probe - 1;
            continue;
        };

        if cur < target {
            low = mid + 1;
        } else if cur > target {
            high = mid - 1;
        } else {
            match bound {
                Bound::Lower => {
                    if timestamp(source, mid - 1).await? == Some(target) {
                        high = mid - 1;
                    } else {
                        return Ok(Some(mid));
                    }
                }
                Bound::Upper => {
                    if timestamp(source, mid + 1).await? == Some(target) {
                        low = mid + 1;
                    } else {
                        return Ok(Some(mid));
                    }
                }
            }
        }
    }
    Ok(None)
}

//! Range negotiation: raw header + known object size -> clamped byte window.

use crate::StreamError;

/// A normalized, fully clamped byte interval of an object.
///
/// Invariants: `start <= end < total_size` and `len() == end - start + 1`,
/// which is the length advertised in the response. Computed once per request
/// and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeWindow {
    pub start: u64,
    pub end: u64,
    pub is_partial: bool,
}

impl RangeWindow {
    /// The whole object, served as a plain 200.
    pub fn full(total_size: u64) -> Self {
        Self {
            start: 0,
            end: total_size.saturating_sub(1),
            is_partial: false,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always `false`: construction guarantees `start <= end`, so a window
    /// covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Parses an optional raw `Range` header against a known `total_size > 0`.
///
/// - No header yields the full window.
/// - `bytes=<start>-` clamps the end to `total_size - 1`.
/// - `bytes=<start>-<end>` clamps `end` to `total_size - 1`.
///
/// Fails when the unit is not `bytes`, the start is missing or non-numeric,
/// `start > end` after clamping, or `start >= total_size`. Suffix ranges
/// (`bytes=-N`) and multi-range sets are rejected the same way; the caller
/// never re-validates bounds on success.
pub fn negotiate_range(
    header: Option<&str>,
    total_size: u64,
) -> Result<RangeWindow, StreamError> {
    let Some(raw) = header else {
        return Ok(RangeWindow::full(total_size));
    };

    let spec = raw
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| StreamError::MalformedRange(format!("unsupported range unit: '{raw}'")))?;

    let (start_raw, end_raw) = spec
        .split_once('-')
        .ok_or_else(|| StreamError::MalformedRange(format!("missing '-' separator: '{raw}'")))?;

    let start: u64 = start_raw
        .trim()
        .parse()
        .map_err(|_| StreamError::MalformedRange(format!("invalid range start: '{raw}'")))?;

    if start >= total_size {
        return Err(StreamError::MalformedRange(format!(
            "range start {start} is beyond object size {total_size}"
        )));
    }

    let end = match end_raw.trim() {
        "" => total_size - 1,
        value => {
            let parsed: u64 = value.parse().map_err(|_| {
                StreamError::MalformedRange(format!("invalid range end: '{raw}'"))
            })?;
            parsed.min(total_size - 1)
        }
    };

    if start > end {
        return Err(StreamError::MalformedRange(format!(
            "range start {start} is past range end {end}"
        )));
    }

    Ok(RangeWindow {
        start,
        end,
        is_partial: true,
    })
}

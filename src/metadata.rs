//! Compact textual representation of an extent list, stored alongside each
//! table's checkpoint metadata.
//!
//! The grammar is `<delta-off>-<len>` pairs joined by `;`, prefixed by the
//! literal `,live_restore=`. Offsets are encoded as the difference from the
//! previous extent's offset (the first one is absolute) to keep the string
//! short for files with many holes. A missing or empty payload means the
//! file is complete.

use std::fmt::Write as _;

use crate::Error;
use crate::Result;
use crate::extent::ExtentList;

/// The metadata key, including the leading separator, under which the
/// extent list is appended to a table's configuration string.
pub const METADATA_PREFIX: &str = ",live_restore=";

/// Render the extent list, including the leading [`METADATA_PREFIX`]. An
/// empty list yields the bare prefix.
pub(crate) fn encode_extents(list: &ExtentList) -> String {
    let mut out = String::from(METADATA_PREFIX);
    let mut prev_off = 0;
    for (i, hole) in list.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        // Writing to a String cannot fail.
        let _ = write!(out, "{}-{}", hole.off - prev_off, hole.len);
        prev_off = hole.off;
    }
    out
}

/// Parse a non-empty extent payload (the part after [`METADATA_PREFIX`])
/// into a list, validating it against the size of the backing source file.
pub(crate) fn decode_extents(payload: &str, source_size: u64) -> Result<ExtentList> {
    let mut list = ExtentList::default();
    let mut off: u64 = 0;
    for part in payload.split(';') {
        let (delta, len) = part
            .split_once('-')
            .ok_or_else(|| invalid("separator", payload))?;
        off += parse_decimal(delta).ok_or_else(|| invalid("offset", payload))?;
        let len = parse_decimal(len).ok_or_else(|| invalid("length", payload))?;
        list.push(off, len)?;
    }
    if list.last_end().is_some_and(|end| end > source_size) {
        return Err(Error::InvalidArgument(format!(
            "extent list '{payload}' has holes beyond the end of the source file ({source_size} bytes)"
        )));
    }
    Ok(list)
}

fn invalid(what: &str, payload: &str) -> Error {
    Error::InvalidArgument(format!("invalid {what} found in extent string '{payload}'"))
}

fn parse_decimal(s: &str) -> Option<u64> {
    // u64::from_str also accepts a leading '+'; the on-disk grammar is
    // digits only.
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

//! Detach key notation.
//!
//! Detach sequences are written the way container engines accept them on
//! the command line: a comma-separated list where each item is either a
//! single printable character or `ctrl-<c>`.
//!
//! ```rust
//! use protocol::detach::{format_detach_keys, parse_detach_keys};
//!
//! let keys = parse_detach_keys("ctrl-p,ctrl-q").unwrap();
//! assert_eq!(keys, vec![0x10, 0x11]);
//! assert_eq!(format_detach_keys(&keys), "ctrl-p,ctrl-q");
//! ```

use crate::error::{ProtocolError, Result};

/// Default detach sequence: Ctrl-P followed by Ctrl-Q.
pub const DEFAULT_DETACH_KEYS: [u8; 2] = [0x10, 0x11];

/// Default detach sequence in key notation.
pub const DEFAULT_DETACH_KEYS_NOTATION: &str = "ctrl-p,ctrl-q";

const CTRL_PREFIX: &str = "ctrl-";

/// Parse detach key notation into the byte sequence it produces.
///
/// An empty string yields an empty sequence, which disables detaching.
pub fn parse_detach_keys(notation: &str) -> Result<Vec<u8>> {
    if notation.is_empty() {
        return Ok(Vec::new());
    }

    notation.split(',').map(parse_key).collect()
}

fn parse_key(item: &str) -> Result<u8> {
    // An untrimmed single byte may itself be a space key.
    if item.len() == 1 {
        return Ok(item.as_bytes()[0]);
    }

    let key = item.trim();
    if key.len() == 1 {
        return Ok(key.as_bytes()[0]);
    }

    let lowered = key.to_ascii_lowercase();
    let Some(rest) = lowered.strip_prefix(CTRL_PREFIX) else {
        return Err(ProtocolError::InvalidDetachKeys(format!(
            "unknown key: {}",
            key
        )));
    };

    let mut chars = rest.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return Err(ProtocolError::InvalidDetachKeys(format!(
            "unknown key: {}",
            key
        )));
    };

    match c {
        'a'..='z' => Ok(c as u8 - b'a' + 1),
        '@' => Ok(0),
        '[' => Ok(27),
        '\\' => Ok(28),
        ']' => Ok(29),
        '^' => Ok(30),
        '_' => Ok(31),
        _ => Err(ProtocolError::InvalidDetachKeys(format!(
            "unknown key: {}",
            key
        ))),
    }
}

/// Render a byte sequence in detach key notation.
///
/// Control bytes render as `ctrl-<c>`, everything else as the character.
pub fn format_detach_keys(keys: &[u8]) -> String {
    keys.iter()
        .map(|&byte| match byte {
            0 => "ctrl-@".to_string(),
            1..=26 => format!("ctrl-{}", (b'a' + byte - 1) as char),
            27 => "ctrl-[".to_string(),
            28 => "ctrl-\\".to_string(),
            29 => "ctrl-]".to_string(),
            30 => "ctrl-^".to_string(),
            31 => "ctrl-_".to_string(),
            other => (other as char).to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

//! Byte-level bencode scanning.
//!
//! `serde_bencode` decodes values but does not report where they sit in the
//! input. The info-hash and BEP 9 metadata messages need exact spans, which
//! these helpers compute without allocating.

use std::ops::Range;

use crate::torrent::TorrentError;

/// Returns the index one past the end of the element starting at `start`.
///
/// # Errors
/// - `TorrentError::InvalidTorrentFile` - Truncated input or invalid bencode syntax
pub fn element_end(data: &[u8], start: usize) -> Result<usize, TorrentError> {
    let mut pos = start;
    let mut depth = 0usize;

    loop {
        let Some(&byte) = data.get(pos) else {
            return Err(invalid("unexpected end of input"));
        };

        match byte {
            b'd' | b'l' => {
                depth += 1;
                pos += 1;
            }
            b'e' => {
                if depth == 0 {
                    return Err(invalid("unexpected end marker"));
                }
                depth -= 1;
                pos += 1;
            }
            b'i' => {
                let close = data[pos + 1..]
                    .iter()
                    .position(|&b| b == b'e')
                    .ok_or_else(|| invalid("unterminated integer"))?;
                pos += close + 2;
            }
            b'0'..=b'9' => {
                let colon = data[pos..]
                    .iter()
                    .position(|&b| b == b':')
                    .ok_or_else(|| invalid("string without length separator"))?;
                let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                    .ok()
                    .and_then(|text| text.parse().ok())
                    .ok_or_else(|| invalid("invalid string length"))?;
                pos = pos
                    .checked_add(colon + 1)
                    .and_then(|body| body.checked_add(length))
                    .filter(|&end| end <= data.len())
                    .ok_or_else(|| invalid("string runs past end of input"))?;
            }
            other => {
                return Err(invalid(&format!(
                    "unexpected byte 0x{other:02x} at offset {pos}"
                )));
            }
        }

        if depth == 0 {
            return Ok(pos);
        }
    }
}

/// Locates the value stored under `key` in the top-level dictionary.
///
/// # Errors
/// - `TorrentError::InvalidTorrentFile` - Input is not a dictionary, is malformed or lacks `key`
pub fn dictionary_value_span(data: &[u8], key: &[u8]) -> Result<Range<usize>, TorrentError> {
    if data.first() != Some(&b'd') {
        return Err(invalid("expected dictionary start"));
    }

    let mut pos = 1;
    while data.get(pos).is_some_and(|&b| b != b'e') {
        let key_end = element_end(data, pos)?;
        let colon = data[pos..key_end]
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| invalid("dictionary key is not a string"))?;
        let found = &data[pos + colon + 1..key_end];

        let value_end = element_end(data, key_end)?;
        if found == key {
            return Ok(key_end..value_end);
        }
        pos = value_end;
    }

    Err(invalid(&format!(
        "missing '{}' key",
        String::from_utf8_lossy(key)
    )))
}

/// Cheap check used to reject non-bencode bodies before reading them whole.
pub fn looks_like_dictionary(prefix: &[u8]) -> bool {
    prefix.first() == Some(&b'd')
}

fn invalid(reason: &str) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_end_for_each_kind() {
        assert_eq!(element_end(b"i42e", 0).unwrap(), 4);
        assert_eq!(element_end(b"4:spam", 0).unwrap(), 6);
        assert_eq!(element_end(b"l4:spami1ee", 0).unwrap(), 11);
        assert_eq!(element_end(b"d3:cow3:mooe", 0).unwrap(), 12);
    }

    #[test]
    fn test_element_end_ignores_markers_inside_strings() {
        let data = b"d4:eeee4:dddde";
        assert_eq!(element_end(data, 0).unwrap(), data.len());
    }

    #[test]
    fn test_element_end_stops_before_trailing_payload() {
        let data = b"d8:msg_typei1e5:piecei0eeRAWDATA";
        assert_eq!(&data[element_end(data, 0).unwrap()..], b"RAWDATA");
    }

    #[test]
    fn test_element_end_rejects_truncated_input() {
        assert!(element_end(b"d3:key", 0).is_err());
        assert!(element_end(b"d3:key999:", 0).is_err());
        assert!(element_end(b"i42", 0).is_err());
        assert!(element_end(b"x", 0).is_err());
    }

    #[test]
    fn test_element_end_rejects_overflowing_string_length() {
        assert!(element_end(b"d18446744073709551596:", 0).is_err());
        assert!(element_end(b"18446744073709551615:", 0).is_err());
        assert!(dictionary_value_span(b"d4:info18446744073709551610:e", b"info").is_err());
    }

    #[test]
    fn test_dictionary_value_span_finds_nested_value() {
        let data = b"d8:announce3:url4:infod4:name1:xe7:comment2:hie";
        let span = dictionary_value_span(data, b"info").unwrap();
        assert_eq!(&data[span], b"d4:name1:xe");
    }

    #[test]
    fn test_dictionary_value_span_missing_key() {
        let data = b"d8:announce3:urle";
        assert!(dictionary_value_span(data, b"info").is_err());
        assert!(dictionary_value_span(b"l4:infoe", b"info").is_err());
    }

    #[test]
    fn test_looks_like_dictionary() {
        assert!(looks_like_dictionary(b"d8:announce"));
        assert!(!looks_like_dictionary(b"<html>"));
        assert!(!looks_like_dictionary(b""));
    }
}

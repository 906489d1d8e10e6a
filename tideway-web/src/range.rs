//! HTTP `Range` header parsing (RFC 7233)

/// What a `Range` header asks for, resolved against the resource size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// Serve the whole resource with `200`
    Full,
    /// Serve bytes `start..=end` with `206`
    Partial { start: u64, end: u64 },
    /// Answer `416` with `Content-Range: bytes */size`
    Unsatisfiable,
}

/// Resolves a `Range` header value against a resource of `size` bytes.
///
/// Handles `bytes=start-end`, open-ended `bytes=start-` and suffix
/// `bytes=-count` forms. Several satisfiable ranges fall back to the full
/// resource instead of a multipart response.
///
/// # Examples
/// ```
/// use tideway_web::range::{RangeRequest, parse_range_header};
/// assert_eq!(
///     parse_range_header("bytes=100-199", 1000),
///     RangeRequest::Partial { start: 100, end: 199 }
/// );
/// ```
pub fn parse_range_header(header: &str, size: u64) -> RangeRequest {
    let Some(specs) = header.trim().strip_prefix("bytes=") else {
        return RangeRequest::Unsatisfiable;
    };

    let mut satisfiable = Vec::new();
    for spec in specs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match parse_spec(spec, size) {
            Spec::Invalid => return RangeRequest::Unsatisfiable,
            Spec::NoOverlap => {}
            Spec::Range(start, end) => satisfiable.push((start, end)),
        }
    }

    match satisfiable.as_slice() {
        [] => RangeRequest::Unsatisfiable,
        [(start, end)] => RangeRequest::Partial {
            start: *start,
            end: *end,
        },
        _ => RangeRequest::Full,
    }
}

enum Spec {
    Invalid,
    NoOverlap,
    Range(u64, u64),
}

fn parse_spec(spec: &str, size: u64) -> Spec {
    let Some((start, end)) = spec.split_once('-') else {
        return Spec::Invalid;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // Suffix range: the last `count` bytes
        let Ok(count) = end.parse::<u64>() else {
            return Spec::Invalid;
        };
        if count == 0 || size == 0 {
            return Spec::NoOverlap;
        }
        return Spec::Range(size - count.min(size), size - 1);
    }

    let Ok(start) = start.parse::<u64>() else {
        return Spec::Invalid;
    };
    if start >= size {
        return Spec::NoOverlap;
    }

    let end = if end.is_empty() {
        size - 1
    } else {
        match end.parse::<u64>() {
            Ok(end) if end >= start => end.min(size - 1),
            _ => return Spec::Invalid,
        }
    };
    Spec::Range(start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_header_valid() {
        assert_eq!(
            parse_range_header("bytes=100-199", 1000),
            RangeRequest::Partial { start: 100, end: 199 }
        );
    }

    #[test]
    fn test_parse_range_header_open_end() {
        assert_eq!(
            parse_range_header("bytes=500-", 1000),
            RangeRequest::Partial { start: 500, end: 999 }
        );
    }

    #[test]
    fn test_parse_range_header_suffix() {
        assert_eq!(
            parse_range_header("bytes=-100", 1000),
            RangeRequest::Partial { start: 900, end: 999 }
        );
        assert_eq!(
            parse_range_header("bytes=-5000", 1000),
            RangeRequest::Partial { start: 0, end: 999 }
        );
    }

    #[test]
    fn test_end_past_size_is_clamped() {
        assert_eq!(
            parse_range_header("bytes=100-99999", 1000),
            RangeRequest::Partial { start: 100, end: 999 }
        );
    }

    #[test]
    fn test_start_past_size_is_unsatisfiable() {
        assert_eq!(parse_range_header("bytes=1000-", 1000), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range_header("bytes=0-", 0), RangeRequest::Unsatisfiable);
    }

    #[test]
    fn test_malformed_ranges_are_unsatisfiable() {
        assert_eq!(parse_range_header("invalid", 1000), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range_header("bytes=9-3", 1000), RangeRequest::Unsatisfiable);
        assert_eq!(parse_range_header("bytes=a-b", 1000), RangeRequest::Unsatisfiable);
    }

    #[test]
    fn test_multiple_ranges_serve_everything() {
        assert_eq!(parse_range_header("bytes=0-9, 20-29", 1000), RangeRequest::Full);
        assert_eq!(
            parse_range_header("bytes=0-9, 5000-6000", 1000),
            RangeRequest::Partial { start: 0, end: 9 }
        );
    }
}

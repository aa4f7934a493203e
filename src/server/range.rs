use axum::http::{HeaderMap, header};
use std::ops::Range;

use crate::error::RestError;

/// One parsed `Range: bytes=` request. Only the first range of a multi-range
/// header is honoured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeRequest {
    pub fn parse(headers: &HeaderMap, content_length: u64) -> Result<Option<Self>, RestError> {
        let Some(range_header) = headers.get(header::RANGE) else {
            return Ok(None);
        };

        let range_str = range_header.to_str().map_err(|_| RestError::InvalidRange)?;
        let Some(spec) = range_str.strip_prefix("bytes=") else {
            return Err(RestError::InvalidRange);
        };

        let first = spec.split(',').next().unwrap_or("").trim();
        let Some((start_str, end_str)) = first.split_once('-') else {
            return Err(RestError::InvalidRange);
        };
        let (start_str, end_str) = (start_str.trim(), end_str.trim());

        let (start, end) = if start_str.is_empty() {
            // Suffix range: "-500" is the last 500 bytes.
            let suffix: u64 = end_str.parse().map_err(|_| RestError::InvalidRange)?;
            if suffix == 0 {
                return Err(RestError::RangeNotSatisfiable);
            }
            (content_length.saturating_sub(suffix), None)
        } else {
            let start = start_str.parse().map_err(|_| RestError::InvalidRange)?;
            let end = if end_str.is_empty() {
                None
            } else {
                Some(end_str.parse().map_err(|_| RestError::InvalidRange)?)
            };
            (start, end)
        };

        if start >= content_length {
            return Err(RestError::RangeNotSatisfiable);
        }
        if let Some(end) = end {
            if start > end {
                return Err(RestError::InvalidRange);
            }
        }

        Ok(Some(Self { start, end }))
    }

    /// Half-open byte range, with the end clamped to the resource size.
    pub fn to_range(&self, content_length: u64) -> Range<u64> {
        let end = self
            .end
            .unwrap_or(content_length - 1)
            .min(content_length - 1);
        self.start..end + 1
    }

    pub fn content_length(&self, total: u64) -> u64 {
        let range = self.to_range(total);
        range.end - range.start
    }

    /// `Content-Range: bytes start-end/total`
    pub fn content_range(&self, total: u64) -> String {
        let range = self.to_range(total);
        format!("bytes {}-{}/{}", range.start, range.end - 1, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn open_ended_range_covers_whole_resource() {
        let r = RangeRequest::parse(&headers("bytes=0-"), 2048).unwrap().unwrap();
        assert_eq!(r.to_range(2048), 0..2048);
        assert_eq!(r.content_length(2048), 2048);
        assert_eq!(r.content_range(2048), "bytes 0-2047/2048");
    }

    #[test]
    fn bounded_range() {
        let r = RangeRequest::parse(&headers("bytes=1048576-2097151"), 4 << 20)
            .unwrap()
            .unwrap();
        assert_eq!(r.to_range(4 << 20), 1_048_576..2_097_152);
        assert_eq!(r.content_range(4 << 20), "bytes 1048576-2097151/4194304");
    }

    #[test]
    fn last_byte_range_is_one_byte() {
        let r = RangeRequest::parse(&headers("bytes=2047-2047"), 2048)
            .unwrap()
            .unwrap();
        assert_eq!(r.content_length(2048), 1);
    }

    #[test]
    fn start_at_size_is_unsatisfiable() {
        assert!(matches!(
            RangeRequest::parse(&headers("bytes=2048-"), 2048),
            Err(RestError::RangeNotSatisfiable)
        ));
    }

    #[test]
    fn suffix_range() {
        let r = RangeRequest::parse(&headers("bytes=-500"), 2048).unwrap().unwrap();
        assert_eq!(r.start, 1548);
        assert_eq!(r.end, None);
    }

    #[test]
    fn end_clamped_to_resource() {
        let r = RangeRequest::parse(&headers("bytes=0-999999"), 100)
            .unwrap()
            .unwrap();
        assert_eq!(r.to_range(100), 0..100);
    }

    #[test]
    fn absent_header_is_none() {
        assert!(RangeRequest::parse(&HeaderMap::new(), 100).unwrap().is_none());
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(RangeRequest::parse(&headers("bytes=a-b"), 100).is_err());
        assert!(RangeRequest::parse(&headers("octets=0-1"), 100).is_err());
    }
}

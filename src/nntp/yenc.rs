use crate::nntp::error::NntpError;

/// Decoded yEnc article payload plus the sizes the encoder declared, so the
/// loader can detect short segments.
#[derive(Debug, Clone)]
pub struct DecodedSegment {
    pub data: Vec<u8>,
    /// `size=` from `=ybegin` (whole encoded file).
    pub file_size: Option<u64>,
    /// `begin=`/`end=` from `=ypart`, 1-based inclusive as on the wire.
    pub part_range: Option<(u64, u64)>,
    /// `size=` from `=yend` (this part).
    pub declared_size: Option<u64>,
}

impl DecodedSegment {
    /// Number of bytes `=yend` (or `=ypart`) claims this segment carries.
    pub fn expected_len(&self) -> Option<u64> {
        self.declared_size
            .or_else(|| self.part_range.map(|(begin, end)| end - begin + 1))
    }
}

/// Decode a raw article body: skip everything before `=ybegin`, strip the
/// yEnc control lines, undo the +42 rotation and `=` escapes. Dot-stuffing
/// is already removed by the transport read.
pub fn decode(article: &[u8]) -> Result<DecodedSegment, NntpError> {
    let mut out = Vec::with_capacity(article.len());
    let mut file_size = None;
    let mut part_range = None;
    let mut declared_size = None;
    let mut in_body = false;
    let mut seen_begin = false;

    for line in article.split(|&b| b == b'\n') {
        let line = trim_line_endings(line);

        if line.starts_with(b"=ybegin") {
            seen_begin = true;
            in_body = true;
            file_size = keyword_u64(line, b"size=");
            continue;
        }
        if line.starts_with(b"=ypart") {
            in_body = true;
            let begin = keyword_u64(line, b"begin=");
            let end = keyword_u64(line, b"end=");
            if let (Some(b), Some(e)) = (begin, end) {
                part_range = Some((b, e));
            }
            continue;
        }
        if line.starts_with(b"=yend") {
            declared_size = keyword_u64(line, b"size=");
            in_body = false;
            continue;
        }
        if !in_body {
            continue;
        }

        decode_line(line, &mut out);
    }

    if !seen_begin {
        return Err(NntpError::Yenc("no =ybegin header in article".to_string()));
    }

    Ok(DecodedSegment {
        data: out,
        file_size,
        part_range,
        declared_size,
    })
}

fn decode_line(line: &[u8], out: &mut Vec<u8>) {
    let mut bytes = line.iter();
    while let Some(&b) = bytes.next() {
        if b == b'=' {
            if let Some(&escaped) = bytes.next() {
                out.push(escaped.wrapping_sub(64).wrapping_sub(42));
            }
        } else {
            out.push(b.wrapping_sub(42));
        }
    }
}

fn trim_line_endings(line: &[u8]) -> &[u8] {
    match line {
        [rest @ .., b'\r'] => rest,
        _ => line,
    }
}

fn keyword_u64(line: &[u8], key: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(line).ok()?;
    let key = std::str::from_utf8(key).ok()?;
    for token in text.split_whitespace() {
        if let Some(value) = token.strip_prefix(key) {
            return value.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &b in data {
            let enc = b.wrapping_add(42);
            match enc {
                0x00 | 0x0a | 0x0d | b'=' => {
                    out.push(b'=');
                    out.push(enc.wrapping_add(64));
                }
                _ => out.push(enc),
            }
        }
        out
    }

    #[test]
    fn round_trips_plain_bytes() {
        let payload = b"hello usenet";
        let mut article = Vec::new();
        article.extend_from_slice(b"=ybegin line=128 size=12 name=test.bin\r\n");
        article.extend_from_slice(&encode(payload));
        article.extend_from_slice(b"\r\n=yend size=12\r\n");

        let decoded = decode(&article).unwrap();
        assert_eq!(decoded.data, payload);
        assert_eq!(decoded.file_size, Some(12));
        assert_eq!(decoded.expected_len(), Some(12));
    }

    #[test]
    fn decodes_escaped_critical_bytes() {
        // 0xd6 + 42 == 0x00, 0x13 + 42 == '=', both must be escaped.
        let payload = [0xd6u8, 0x13, 0xe3, 0xe9];
        let mut article = Vec::new();
        article.extend_from_slice(b"=ybegin part=1 line=128 size=4 name=x\r\n");
        article.extend_from_slice(b"=ypart begin=1 end=4\r\n");
        article.extend_from_slice(&encode(&payload));
        article.extend_from_slice(b"\r\n=yend size=4 part=1\r\n");

        let decoded = decode(&article).unwrap();
        assert_eq!(decoded.data, payload);
        assert_eq!(decoded.part_range, Some((1, 4)));
    }

    #[test]
    fn leading_headers_are_ignored() {
        let mut article = Vec::new();
        article.extend_from_slice(b"X-Received: something\r\n\r\n");
        article.extend_from_slice(b"=ybegin line=128 size=2 name=x\r\n");
        article.extend_from_slice(&encode(b"ab"));
        article.extend_from_slice(b"\r\n=yend size=2\r\n");

        assert_eq!(decode(&article).unwrap().data, b"ab");
    }

    #[test]
    fn missing_begin_is_an_error() {
        assert!(decode(b"plain text, not yenc\r\n").is_err());
    }
}

use crate::http::{Method, Request, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The request line or a header line is not well-formed.
    Malformed,
    /// More header lines than the configured maximum.
    TooManyHeaders,
    /// The request target exceeds the configured maximum.
    UriTooLong,
    /// The method token is not one we implement.
    InvalidMethod,
    /// The version token is not HTTP/1.0 or HTTP/1.1.
    VersionNotSupported,
    /// A length field does not fit the addressable range.
    ContentTooLarge,
}

/// Find the end of the head section (the offset just past `\r\n\r\n`),
/// searching from `from`. Callers resume the scan a few bytes before the end
/// of previously seen data so a terminator split across receives is found.
pub fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let mut i = from.min(buf.len() - 4);
    while i + 4 <= buf.len() {
        if &buf[i..i + 4] == b"\r\n\r\n" {
            return Some(i + 4);
        }
        i += 1;
    }
    None
}

/// Parse a complete head section (`buf` runs through the final `\r\n\r\n`)
/// into a borrowed [`Request`] with an empty body. The caller attaches the
/// body slice once framing is settled.
pub fn parse_headers<'a>(
    buf: &'a [u8],
    uri_max: usize,
    header_max: usize,
) -> Result<Request<'a>, ParseError> {
    // Request line: METHOD SP TARGET SP VERSION CRLF
    let mut space1 = 0;
    while space1 < buf.len() && buf[space1] != b' ' && buf[space1] != b'\r' {
        space1 += 1;
    }
    if space1 >= buf.len() || buf[space1] != b' ' || space1 == 0 {
        return Err(ParseError::Malformed);
    }
    let method = Method::from_bytes(&buf[..space1]).ok_or(ParseError::InvalidMethod)?;

    let mut space2 = space1 + 1;
    while space2 < buf.len() && buf[space2] != b' ' && buf[space2] != b'\r' {
        space2 += 1;
    }
    if space2 >= buf.len() || buf[space2] != b' ' {
        return Err(ParseError::Malformed);
    }
    let target_bytes = &buf[space1 + 1..space2];
    if target_bytes.is_empty() {
        return Err(ParseError::Malformed);
    }
    if target_bytes.len() > uri_max {
        return Err(ParseError::UriTooLong);
    }
    let target = std::str::from_utf8(target_bytes).map_err(|_| ParseError::Malformed)?;
    let (path, query) = match target.find('?') {
        Some(idx) => (&target[..idx], Some(&target[idx + 1..])),
        None => (target, None),
    };

    let mut line_end = space2 + 1;
    while line_end + 1 < buf.len() && !(buf[line_end] == b'\r' && buf[line_end + 1] == b'\n') {
        line_end += 1;
    }
    if line_end + 1 >= buf.len() {
        return Err(ParseError::Malformed);
    }
    let version_token = &buf[space2 + 1..line_end];
    let version = if version_token == b"HTTP/1.1" {
        Version::Http11
    } else if version_token == b"HTTP/1.0" {
        Version::Http10
    } else if version_token.starts_with(b"HTTP/") {
        return Err(ParseError::VersionNotSupported);
    } else {
        return Err(ParseError::Malformed);
    };

    let mut headers = Vec::with_capacity(header_max.min(32));
    let mut cursor = line_end + 2;
    loop {
        if cursor + 1 >= buf.len() {
            return Err(ParseError::Malformed);
        }
        if buf[cursor] == b'\r' && buf[cursor + 1] == b'\n' {
            break; // end of headers
        }
        if headers.len() >= header_max {
            return Err(ParseError::TooManyHeaders);
        }

        let mut colon = cursor;
        while colon < buf.len() && buf[colon] != b':' && buf[colon] != b'\r' {
            colon += 1;
        }
        if colon >= buf.len() || buf[colon] != b':' || colon == cursor {
            return Err(ParseError::Malformed);
        }
        let name = std::str::from_utf8(&buf[cursor..colon]).map_err(|_| ParseError::Malformed)?;

        let mut value_end = colon + 1;
        while value_end + 1 < buf.len()
            && !(buf[value_end] == b'\r' && buf[value_end + 1] == b'\n')
        {
            value_end += 1;
        }
        if value_end + 1 >= buf.len() {
            return Err(ParseError::Malformed);
        }
        let mut value_start = colon + 1;
        while value_start < value_end && buf[value_start] == b' ' {
            value_start += 1;
        }
        let value =
            std::str::from_utf8(&buf[value_start..value_end]).map_err(|_| ParseError::Malformed)?;

        headers.push((name, value));
        cursor = value_end + 2;
    }

    Ok(Request {
        method,
        version,
        path,
        query,
        headers,
        body: &[],
    })
}

/// Extract `Content-Length` from an already-parsed request. `Ok(None)` when
/// the header is absent; the caller decides whether absence is an error for
/// the method at hand.
pub fn content_length(req: &Request) -> Result<Option<u64>, ParseError> {
    let raw = match req.header("Content-Length") {
        Some(v) => v.trim(),
        None => return Ok(None),
    };
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::Malformed);
    }
    raw.parse::<u64>().map(Some).map_err(|_| ParseError::ContentTooLarge)
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI_MAX: usize = 2048;
    const HEADER_MAX: usize = 32;

    fn parse(buf: &[u8]) -> Result<Request<'_>, ParseError> {
        parse_headers(buf, URI_MAX, HEADER_MAX)
    }

    #[test]
    fn basic_request() {
        let req = parse(b"GET /some/path?foo=bar HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n")
            .unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.path, "/some/path");
        assert_eq!(req.query, Some("foo=bar"));
        assert_eq!(req.headers.len(), 2);
        assert_eq!(req.headers[0], ("Host", "localhost"));
        assert_eq!(req.header("host"), Some("localhost"));
    }

    #[test]
    fn unknown_method() {
        assert!(matches!(
            parse(b"BREW / HTTP/1.1\r\n\r\n"),
            Err(ParseError::InvalidMethod)
        ));
    }

    #[test]
    fn version_gate() {
        assert!(matches!(
            parse(b"GET / HTTP/2.0\r\n\r\n"),
            Err(ParseError::VersionNotSupported)
        ));
        assert!(matches!(parse(b"GET / FTP/1.0\r\n\r\n"), Err(ParseError::Malformed)));
        assert_eq!(parse(b"GET / HTTP/1.0\r\n\r\n").unwrap().version, Version::Http10);
    }

    #[test]
    fn uri_cap() {
        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(URI_MAX + 1));
        assert!(matches!(parse(long.as_bytes()), Err(ParseError::UriTooLong)));
    }

    #[test]
    fn header_cap() {
        let mut raw = String::from("GET / HTTP/1.1\r\n");
        for i in 0..HEADER_MAX + 1 {
            raw.push_str(&format!("X-H{}: v\r\n", i));
        }
        raw.push_str("\r\n");
        assert!(matches!(parse(raw.as_bytes()), Err(ParseError::TooManyHeaders)));
    }

    #[test]
    fn malformed_lines() {
        assert!(matches!(parse(b"GET /\r\n\r\n"), Err(ParseError::Malformed)));
        assert!(matches!(
            parse(b"GET / HTTP/1.1\r\nNoColonHere\r\n\r\n"),
            Err(ParseError::Malformed)
        ));
    }

    #[test]
    fn content_length_values() {
        let req = parse(b"POST / HTTP/1.1\r\nContent-Length: 42\r\n\r\n").unwrap();
        assert_eq!(content_length(&req).unwrap(), Some(42));

        let req = parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(content_length(&req).unwrap(), None);

        let req = parse(b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n").unwrap();
        assert!(matches!(content_length(&req), Err(ParseError::Malformed)));

        let req = parse(b"POST / HTTP/1.1\r\nContent-Length: 99999999999999999999999\r\n\r\n")
            .unwrap();
        assert!(matches!(content_length(&req), Err(ParseError::ContentTooLarge)));
    }

    #[test]
    fn head_end_search() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\n", 0), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r", 0), None);

        // Terminator split across two appends: the resumed scan must see it.
        let mut buf = b"GET / HTTP/1.1\r\n\r".to_vec();
        let resume = buf.len().saturating_sub(3);
        buf.push(b'\n');
        assert_eq!(find_head_end(&buf, resume), Some(buf.len()));
    }
}

use crate::error::{Error, ProtocolErrorKind, Result};

/// An RTSP request (RFC 2326 §6), parsed from the wire or built by a client.
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// [body]
/// ```
///
/// Header lookup is case-insensitive per RFC 2326 §4.2.
#[derive(Debug, Clone)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, ANNOUNCE, SETUP, RECORD, etc.).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/live/test/streamid=0`).
    pub uri: String,
    pub version: String,
    /// Headers as ordered (name, value) pairs, names as received.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RtspRequest {
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            version: super::RTSP_VERSION.to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Parse the request line and headers of `head`. The body, if any, is
    /// read separately by the framer and attached with [`with_body`](Self::with_body).
    pub fn parse(head: &str) -> Result<Self> {
        let mut lines = head.lines();

        let request_line = lines
            .next()
            .ok_or(Error::invalid(ProtocolErrorKind::EmptyMessage))?;
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(Error::invalid(ProtocolErrorKind::InvalidRequestLine));
        }

        let version = parts[2].to_string();
        if version != super::RTSP_VERSION {
            tracing::warn!(version, "peer sent non-RTSP/1.0 version");
        }

        Ok(Self {
            method: parts[0].to_string(),
            uri: parts[1].to_string(),
            version,
            headers: parse_header_lines(lines)?,
            body: String::new(),
        })
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// CSeq numbers request/response pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get_header(super::header::CSEQ)
    }

    pub fn content_length(&self) -> usize {
        content_length(&self.headers)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = body;
        self
    }

    /// Serialize to the wire format. `Content-Length` is appended when a
    /// body is present.
    pub fn serialize(&self) -> String {
        let mut request = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        for (name, value) in &self.headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        if !self.body.is_empty() && self.get_header(super::header::CONTENT_LENGTH).is_none() {
            request.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        request.push_str("\r\n");
        request.push_str(&self.body);
        request
    }
}

/// Header lines up to the first empty line.
pub(crate) fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or(Error::invalid(ProtocolErrorKind::InvalidHeader))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

pub(crate) fn content_length(headers: &[(String, String)]) -> usize {
    find_header(headers, super::header::CONTENT_LENGTH)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_request() {
        let raw = "OPTIONS rtsp://localhost:8554/test RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.uri, "rtsp://localhost:8554/test");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some("1"));
        assert_eq!(req.content_length(), 0);
    }

    #[test]
    fn parse_setup_with_transport() {
        let raw = "SETUP rtsp://localhost:8554/test/streamid=0 RTSP/1.0\r\n\
                   CSeq: 3\r\n\
                   Transport: RTP/AVP/TCP;unicast;interleaved=0-1;mode=record\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "SETUP");
        assert_eq!(
            req.get_header("transport"),
            Some("RTP/AVP/TCP;unicast;interleaved=0-1;mode=record")
        );
    }

    #[test]
    fn parse_empty_request() {
        assert!(RtspRequest::parse("").is_err());
    }

    #[test]
    fn parse_invalid_request_line() {
        assert!(RtspRequest::parse("JUST_A_METHOD\r\n\r\n").is_err());
    }

    #[test]
    fn header_without_colon_is_invalid() {
        assert!(RtspRequest::parse("OPTIONS * RTSP/1.0\r\nCSeq 1\r\n\r\n").is_err());
    }

    #[test]
    fn serialize_announce_with_body() {
        let req = RtspRequest::new("ANNOUNCE", "rtsp://h/live/test")
            .add_header("CSeq", "2")
            .add_header("Content-Type", "application/sdp")
            .with_body("v=0\r\n".to_string());
        let s = req.serialize();
        assert!(s.starts_with("ANNOUNCE rtsp://h/live/test RTSP/1.0\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nv=0\r\n"));

        let parsed = RtspRequest::parse(&s).unwrap();
        assert_eq!(parsed.content_length(), 5);
        assert_eq!(parsed.cseq(), Some("2"));
    }
}

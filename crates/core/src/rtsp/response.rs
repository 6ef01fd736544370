use super::request::{content_length, find_header, parse_header_lines};
use crate::error::{Error, ProtocolErrorKind, Result};

/// An RTSP response (RFC 2326 §7).
///
/// ```text
/// RTSP/1.0 200 OK\r\n
/// CSeq: 1\r\n
/// Content-Type: application/sdp\r\n
/// Content-Length: 142\r\n
/// \r\n
/// v=0\r\n...
/// ```
///
/// Built with [`add_header`](Self::add_header) and
/// [`with_body`](Self::with_body), then [`serialize`](Self::serialize)d;
/// `Content-Length` is computed when a body is present.
#[must_use]
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RtspResponse {
    pub fn new(status_code: u16, status_text: &str) -> Self {
        RtspResponse {
            status_code,
            status_text: status_text.to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn bad_request() -> Self {
        Self::new(400, "Bad Request")
    }

    pub fn unauthorized() -> Self {
        Self::new(401, "Unauthorized")
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not Found")
    }

    pub fn not_acceptable() -> Self {
        Self::new(406, "Not Acceptable")
    }

    /// 455, a request that is valid but not in the session's current state.
    pub fn method_not_valid() -> Self {
        Self::new(455, "Method Not Valid in This State")
    }

    pub fn unsupported_transport() -> Self {
        Self::new(461, "Unsupported Transport")
    }

    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    pub fn not_implemented() -> Self {
        Self::new(501, "Not Implemented")
    }

    /// Parse the status line and headers of `head`.
    pub fn parse(head: &str) -> Result<Self> {
        let mut lines = head.lines();
        let status_line = lines
            .next()
            .ok_or(Error::invalid(ProtocolErrorKind::EmptyMessage))?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("RTSP/") {
            return Err(Error::invalid(ProtocolErrorKind::InvalidStatusLine));
        }
        let status_code = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or(Error::invalid(ProtocolErrorKind::InvalidStatusLine))?;
        let status_text = parts.next().unwrap_or_default().trim().to_string();

        Ok(Self {
            status_code,
            status_text,
            headers: parse_header_lines(lines)?,
            body: String::new(),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status_code == 200
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

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

    pub fn serialize(&self) -> String {
        let mut response = format!(
            "{} {} {}\r\n",
            super::RTSP_VERSION,
            self.status_code,
            self.status_text
        );
        for (name, value) in &self.headers {
            response.push_str(&format!("{name}: {value}\r\n"));
        }
        if !self.body.is_empty() {
            response.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        response.push_str("\r\n");
        response.push_str(&self.body);
        response
    }

    /// [`Error::Status`] unless this is a 200.
    pub fn ensure_ok(self) -> Result<Self> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::Status {
                code: self.status_code,
                reason: self.status_text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_no_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "1")
            .add_header("Public", "OPTIONS");
        let s = resp.serialize();
        assert!(s.starts_with("RTSP/1.0 200 OK\r\n"));
        assert!(s.contains("CSeq: 1\r\n"));
        assert!(s.contains("Public: OPTIONS\r\n"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn serialize_with_body() {
        let resp = RtspResponse::ok()
            .add_header("CSeq", "2")
            .with_body("v=0\r\n".to_string());
        let s = resp.serialize();
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn parse_status_line_and_headers() {
        let resp = RtspResponse::parse(
            "RTSP/1.0 401 Unauthorized\r\nCSeq: 3\r\nWWW-Authenticate: Digest realm=\"r\", nonce=\"n\"\r\n\r\n",
        )
        .unwrap();
        assert_eq!(resp.status_code, 401);
        assert_eq!(resp.status_text, "Unauthorized");
        assert_eq!(resp.cseq(), Some("3"));
        assert!(resp.get_header("www-authenticate").unwrap().starts_with("Digest"));
    }

    #[test]
    fn non_200_becomes_status_error() {
        let err = RtspResponse::not_found().ensure_ok().unwrap_err();
        assert_eq!(err.to_string(), "unexpected RTSP status 404 Not Found");
    }

    #[test]
    fn invalid_status_line() {
        assert!(RtspResponse::parse("HTTP/1.1 200 OK\r\n\r\n").is_err());
        assert!(RtspResponse::parse("RTSP/1.0 abc OK\r\n\r\n").is_err());
    }
}

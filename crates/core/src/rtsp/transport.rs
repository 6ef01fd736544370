use crate::error::{Error, ProtocolErrorKind, Result};

/// Lower transport of an RTP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    Udp,
    /// Interleaved on the RTSP connection (RFC 2326 §10.12).
    Tcp,
}

/// The `Transport` header (RFC 2326 §12.39).
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP/UDP;unicast;client_port=30000-30001
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1;mode=record
///
/// Server → Client:
///   Transport: RTP/AVP/UDP;unicast;client_port=30000-30001;server_port=30002-30003
/// ```
///
/// Port and channel ranges with a single value imply `n-(n+1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    pub lower: LowerTransport,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    pub interleaved: Option<(u8, u8)>,
    /// `mode=record`: the client publishes.
    pub record: bool,
}

impl TransportHeader {
    /// Request for UDP delivery to `rtp_port`/`rtp_port + 1`.
    pub fn client_udp(rtp_port: u16, record: bool) -> Self {
        Self {
            lower: LowerTransport::Udp,
            client_port: Some((rtp_port, rtp_port.wrapping_add(1))),
            server_port: None,
            interleaved: None,
            record,
        }
    }

    /// Request for interleaved delivery on channels `rtp_channel`/`rtp_channel + 1`.
    pub fn client_tcp(rtp_channel: u8, record: bool) -> Self {
        Self {
            lower: LowerTransport::Tcp,
            client_port: None,
            server_port: None,
            interleaved: Some((rtp_channel, rtp_channel.wrapping_add(1))),
            record,
        }
    }

    pub fn with_server_port(mut self, rtp_port: u16, rtcp_port: u16) -> Self {
        self.server_port = Some((rtp_port, rtcp_port));
        self
    }

    pub fn with_interleaved(mut self, rtp_channel: u8, rtcp_channel: u8) -> Self {
        self.interleaved = Some((rtp_channel, rtcp_channel));
        self
    }

    pub fn parse(header: &str) -> Result<Self> {
        let invalid = || Error::invalid(ProtocolErrorKind::InvalidTransport);
        let mut parts = header.split(';').map(str::trim);

        let profile = parts.next().ok_or_else(invalid)?;
        let lower = match profile.to_ascii_uppercase().as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => LowerTransport::Udp,
            "RTP/AVP/TCP" => LowerTransport::Tcp,
            _ => return Err(invalid()),
        };

        let mut th = Self {
            lower,
            client_port: None,
            server_port: None,
            interleaved: None,
            record: false,
        };
        for part in parts {
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim().trim_matches('"')),
                None => (part, ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "client_port" => th.client_port = Some(parse_range(value).ok_or_else(invalid)?),
                "server_port" => th.server_port = Some(parse_range(value).ok_or_else(invalid)?),
                "interleaved" => th.interleaved = Some(parse_range(value).ok_or_else(invalid)?),
                "mode" => th.record = value.eq_ignore_ascii_case("record"),
                _ => {}
            }
        }

        if th.lower == LowerTransport::Tcp && th.interleaved.is_none() {
            tracing::debug!(header, "tcp transport without interleaved channels");
        }
        Ok(th)
    }

    /// Header value, parameters in conventional order.
    pub fn to_header_value(&self) -> String {
        let mut v = match self.lower {
            LowerTransport::Udp => "RTP/AVP/UDP;unicast".to_string(),
            LowerTransport::Tcp => "RTP/AVP/TCP;unicast".to_string(),
        };
        if let Some((a, b)) = self.client_port {
            v.push_str(&format!(";client_port={a}-{b}"));
        }
        if let Some((a, b)) = self.server_port {
            v.push_str(&format!(";server_port={a}-{b}"));
        }
        if let Some((a, b)) = self.interleaved {
            v.push_str(&format!(";interleaved={a}-{b}"));
        }
        if self.record {
            v.push_str(";mode=record");
        }
        v
    }
}

trait Successor: Sized + std::str::FromStr {
    fn successor(self) -> Self;
}

impl Successor for u16 {
    fn successor(self) -> Self {
        self.wrapping_add(1)
    }
}

impl Successor for u8 {
    fn successor(self) -> Self {
        self.wrapping_add(1)
    }
}

fn parse_range<T: Successor + Copy>(value: &str) -> Option<(T, T)> {
    match value.split_once('-') {
        Some((a, b)) => Some((a.trim().parse().ok()?, b.trim().parse().ok()?)),
        None => {
            let a: T = value.trim().parse().ok()?;
            Some((a, a.successor()))
        }
    }
}

//! RTSP 1.0 over TCP with RTP/RTCP on UDP port pairs or interleaved on
//! the command connection.
//!
//! The server side is [`RtspServer`], which hands [`PubSession`]s and
//! [`SubSession`]s to an [`RtspServerObserver`]. The client side is
//! [`PullSession`] and [`PushSession`].

pub mod auth;
pub mod channel;
mod client;
pub mod in_session;
pub mod out_session;
pub mod pub_session;
pub mod pull_session;
pub mod push_session;
pub mod reader;
pub mod request;
pub mod response;
pub mod server;
mod server_command_session;
pub mod sub_session;
pub mod transport;

pub use auth::{AuthScheme, Challenge, DigestAuthenticator};
pub use channel::MediaChannel;
pub use pub_session::PubSession;
pub use pull_session::PullSession;
pub use push_session::PushSession;
pub use reader::{FrameReader, RtspFrame};
pub use request::RtspRequest;
pub use response::RtspResponse;
pub use server::{RtspServer, RtspServerObserver};
pub use sub_session::SubSession;
pub use transport::{LowerTransport, TransportHeader};

pub const RTSP_VERSION: &str = "RTSP/1.0";

pub mod method {
    pub const OPTIONS: &str = "OPTIONS";
    pub const ANNOUNCE: &str = "ANNOUNCE";
    pub const DESCRIBE: &str = "DESCRIBE";
    pub const SETUP: &str = "SETUP";
    pub const PLAY: &str = "PLAY";
    pub const RECORD: &str = "RECORD";
    pub const TEARDOWN: &str = "TEARDOWN";
    pub const GET_PARAMETER: &str = "GET_PARAMETER";
}

pub mod header {
    pub const CSEQ: &str = "CSeq";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const CONTENT_BASE: &str = "Content-Base";
    pub const TRANSPORT: &str = "Transport";
    pub const SESSION: &str = "Session";
    pub const PUBLIC: &str = "Public";
    pub const SERVER: &str = "Server";
    pub const USER_AGENT: &str = "User-Agent";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
    pub const RANGE: &str = "Range";
    pub const ACCEPT: &str = "Accept";
}

/// Methods the server answers, as listed in its OPTIONS reply.
pub const PUBLIC_METHODS: &str = "OPTIONS, ANNOUNCE, DESCRIBE, SETUP, PLAY, RECORD, TEARDOWN, GET_PARAMETER";

//! HTTP-FLV output: FLV tag framing of RTMP messages, and a server whose
//! sessions answer `GET /app/stream.flv` with an endless FLV body.
//!
//! As with RTMP, which publisher feeds which player is up to the
//! [`HttpFlvServerObserver`].

pub mod flv;
pub mod server;
pub mod sub_session;

pub use flv::{FLV_HEADER, FlvTag};
pub use server::{HttpFlvServer, HttpFlvServerObserver};
pub use sub_session::{HttpRequestHead, SubSession};

pub const DEFAULT_PORT: u16 = 8080;

//! HTTP-FLV players against a live server, spoken to with a bare TCP
//! socket.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use streamcore::codec::avc;
use streamcore::httpflv::{FLV_HEADER, FlvTag, HttpFlvServer, HttpFlvServerObserver, SubSession};
use streamcore::rtmp::{RtmpMessage, csid, type_id};
use streamcore::{Error, Result, Runtime, Session};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{PPS, SPS, wait_until};

#[derive(Default)]
struct Players {
    refuse: bool,
    sessions: Mutex<Vec<Arc<SubSession>>>,
    closed: Mutex<usize>,
}

impl HttpFlvServerObserver for Players {
    fn on_new_http_flv_sub_session(&self, session: &Arc<SubSession>) -> Result<()> {
        if self.refuse {
            return Err(Error::ResourceExhausted("no such stream".into()));
        }
        self.sessions.lock().push(session.clone());
        Ok(())
    }

    fn on_del_http_flv_sub_session(&self, _session: &Arc<SubSession>) {
        *self.closed.lock() += 1;
    }
}

async fn start(players: Arc<Players>) -> (Arc<HttpFlvServer>, SocketAddr) {
    let server = Arc::new(HttpFlvServer::new("127.0.0.1:0", players, Runtime::default()));
    let addr = server.listen().await.unwrap();
    tokio::spawn({
        let s = server.clone();
        async move { s.run_loop().await }
    });
    (server, addr)
}

async fn get(addr: SocketAddr, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nUser-Agent: test\r\n\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();
    stream
}

/// Read until `done` accepts what has arrived so far.
async fn read_until(stream: &mut TcpStream, mut done: impl FnMut(&[u8]) -> bool) -> Vec<u8> {
    let mut got = Vec::new();
    let mut buf = [0u8; 4096];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(&got) {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .unwrap();
    got
}

fn head_end(b: &[u8]) -> Option<usize> {
    b.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

#[tokio::test]
async fn player_receives_header_and_tags() {
    let players = Arc::new(Players::default());
    let (server, addr) = start(players.clone()).await;

    let mut stream = get(addr, "/live/test.flv").await;
    wait_until(|| players.sessions.lock().len() == 1).await;
    let session = players.sessions.lock()[0].clone();
    assert_eq!(session.stream_name(), "test");
    assert_eq!(session.app_name(), "live");
    assert_eq!(session.request().header("user-agent"), Some("test"));

    let seq = RtmpMessage::new(
        csid::VIDEO,
        type_id::VIDEO,
        1,
        0x0123_4567,
        avc::build_seq_header(SPS, PPS).unwrap(),
    );
    session.write_rtmp_message(&seq).unwrap();
    // Not an FLV tag: ignored.
    let ack = RtmpMessage::new(csid::PROTOCOL_CONTROL, type_id::ACK, 0, 0, Bytes::from_static(&[0; 4]));
    session.write_rtmp_message(&ack).unwrap();
    let tag_len = FlvTag::from_rtmp(&seq).unwrap().pack().len();

    let got = read_until(&mut stream, |b| {
        head_end(b).is_some_and(|h| b.len() >= h + FLV_HEADER.len() + tag_len)
    })
    .await;
    let h = head_end(&got).unwrap();
    let head = std::str::from_utf8(&got[..h]).unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Type: video/x-flv"));
    assert_eq!(&got[h..h + FLV_HEADER.len()], &FLV_HEADER);

    let (tag, used) = FlvTag::parse(&got[h + FLV_HEADER.len()..]).unwrap();
    assert_eq!(used, tag_len);
    assert_eq!(tag.tag_type, type_id::VIDEO);
    assert_eq!(tag.timestamp, 0x0123_4567);
    assert_eq!(tag.body, seq.payload);
    assert_eq!(got.len(), h + FLV_HEADER.len() + tag_len);

    drop(stream);
    wait_until(|| *players.closed.lock() == 1).await;
    server.dispose();
}

#[tokio::test]
async fn non_flv_path_is_not_found() {
    let players = Arc::new(Players::default());
    let (server, addr) = start(players.clone()).await;

    let mut stream = get(addr, "/live/test.m3u8").await;
    let got = read_until(&mut stream, |b| head_end(b).is_some()).await;
    assert!(got.starts_with(b"HTTP/1.1 404"));
    assert!(players.sessions.lock().is_empty());
    server.dispose();
}

#[tokio::test]
async fn refused_stream_is_not_found() {
    let players = Arc::new(Players {
        refuse: true,
        ..Default::default()
    });
    let (server, addr) = start(players.clone()).await;

    let mut stream = get(addr, "/live/missing.flv").await;
    let got = read_until(&mut stream, |b| head_end(b).is_some()).await;
    assert!(got.starts_with(b"HTTP/1.1 404"));
    assert_eq!(*players.closed.lock(), 0);
    server.dispose();
}

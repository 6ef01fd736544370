//! Builders for the protocol-control and AMF0 command messages the sessions
//! exchange, and parsers for the ones they receive.

use bytes::{BufMut, Bytes, BytesMut};

use super::{RtmpMessage, csid, type_id, user_control};
use crate::amf0::{self, Amf0Object, Amf0Value};
use crate::error::{Error, ProtocolErrorKind, Result};

pub const CMD_CONNECT: &str = "connect";
pub const CMD_RESULT: &str = "_result";
pub const CMD_ERROR: &str = "_error";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_RELEASE_STREAM: &str = "releaseStream";
pub const CMD_FC_PUBLISH: &str = "FCPublish";
pub const CMD_FC_UNPUBLISH: &str = "FCUnpublish";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_PLAY: &str = "play";
pub const CMD_DELETE_STREAM: &str = "deleteStream";
pub const CMD_CLOSE_STREAM: &str = "closeStream";
pub const CMD_ON_STATUS: &str = "onStatus";
pub const CMD_GET_STREAM_LENGTH: &str = "getStreamLength";

pub const CODE_CONNECT_SUCCESS: &str = "NetConnection.Connect.Success";
pub const CODE_PUBLISH_START: &str = "NetStream.Publish.Start";
pub const CODE_PLAY_START: &str = "NetStream.Play.Start";

/// `fmsVer` advertised in the connect result.
const FMS_VERSION: &str = "FMS/3,0,1,123";
const SET_DATA_FRAME: &[u8] = b"\x02\x00\x0d@setDataFrame";

/// Bandwidth limit type of SetPeerBandwidth.
pub const PEER_BANDWIDTH_DYNAMIC: u8 = 2;

fn control(type_id: u8, body: Bytes) -> RtmpMessage {
    RtmpMessage::new(csid::PROTOCOL_CONTROL, type_id, 0, 0, body)
}

pub fn set_chunk_size(size: u32) -> RtmpMessage {
    control(type_id::SET_CHUNK_SIZE, Bytes::copy_from_slice(&size.to_be_bytes()))
}

pub fn window_ack_size(size: u32) -> RtmpMessage {
    control(type_id::WINDOW_ACK_SIZE, Bytes::copy_from_slice(&size.to_be_bytes()))
}

pub fn set_peer_bandwidth(size: u32, limit_type: u8) -> RtmpMessage {
    let mut b = BytesMut::with_capacity(5);
    b.put_u32(size);
    b.put_u8(limit_type);
    control(type_id::SET_PEER_BANDWIDTH, b.freeze())
}

pub fn ack(sequence: u32) -> RtmpMessage {
    control(type_id::ACK, Bytes::copy_from_slice(&sequence.to_be_bytes()))
}

pub fn user_control(event: u16, value: u32) -> RtmpMessage {
    let mut b = BytesMut::with_capacity(6);
    b.put_u16(event);
    b.put_u32(value);
    control(type_id::USER_CONTROL, b.freeze())
}

pub fn stream_begin(stream_id: u32) -> RtmpMessage {
    user_control(user_control::STREAM_BEGIN, stream_id)
}

pub fn ping_response(timestamp: u32) -> RtmpMessage {
    user_control(user_control::PING_RESPONSE, timestamp)
}

pub fn set_buffer_length(stream_id: u32, buffer_ms: u32) -> RtmpMessage {
    let mut b = BytesMut::with_capacity(10);
    b.put_u16(user_control::SET_BUFFER_LENGTH);
    b.put_u32(stream_id);
    b.put_u32(buffer_ms);
    control(type_id::USER_CONTROL, b.freeze())
}

/// The 4-byte big-endian body of SetChunkSize, Ack, WindowAckSize and
/// SetPeerBandwidth.
pub fn parse_u32_body(payload: &[u8]) -> Result<u32> {
    let b: [u8; 4] = payload
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(Error::short(4, payload.len()))?;
    Ok(u32::from_be_bytes(b))
}

/// `(event, first 32-bit value)` of a user-control message.
pub fn parse_user_control(payload: &[u8]) -> Result<(u16, u32)> {
    if payload.len() < 6 {
        return Err(Error::short(6, payload.len()));
    }
    let event = u16::from_be_bytes([payload[0], payload[1]]);
    Ok((event, parse_u32_body(&payload[2..])?))
}

fn command(csid: u32, stream_id: u32, values: &[Amf0Value]) -> Result<RtmpMessage> {
    let body = amf0::encode(values)?;
    Ok(RtmpMessage::new(csid, type_id::COMMAND_AMF0, stream_id, 0, body))
}

fn str_value(s: &str) -> Amf0Value {
    Amf0Value::String(s.to_string())
}

pub fn connect(tid: u32, app: &str, tc_url: &str, flash_ver: &str, is_push: bool) -> Result<RtmpMessage> {
    let mut obj = Amf0Object::new()
        .with("app", app)
        .with("type", "nonprivate")
        .with("flashVer", flash_ver)
        .with("tcUrl", tc_url);
    if !is_push {
        obj.insert("fpad", false);
        obj.insert("capabilities", 15.0);
        obj.insert("audioCodecs", 3191.0);
        obj.insert("videoCodecs", 252.0);
        obj.insert("videoFunction", 1.0);
    }
    command(
        csid::OVER_CONNECTION,
        0,
        &[str_value(CMD_CONNECT), Amf0Value::Number(tid as f64), obj.into()],
    )
}

pub fn connect_result(tid: f64, library_tag: &str) -> Result<RtmpMessage> {
    let props = Amf0Object::new()
        .with("fmsVer", FMS_VERSION)
        .with("capabilities", 31.0)
        .with("mode", 1.0);
    let info = Amf0Object::new()
        .with("level", "status")
        .with("code", CODE_CONNECT_SUCCESS)
        .with("description", "Connection succeeded.")
        .with("objectEncoding", 0.0)
        .with("version", library_tag);
    command(
        csid::OVER_CONNECTION,
        0,
        &[str_value(CMD_RESULT), Amf0Value::Number(tid), props.into(), info.into()],
    )
}

pub fn create_stream(tid: u32) -> Result<RtmpMessage> {
    command(
        csid::OVER_CONNECTION,
        0,
        &[str_value(CMD_CREATE_STREAM), Amf0Value::Number(tid as f64), Amf0Value::Null],
    )
}

pub fn create_stream_result(tid: f64, stream_id: u32) -> Result<RtmpMessage> {
    command(
        csid::OVER_CONNECTION,
        0,
        &[
            str_value(CMD_RESULT),
            Amf0Value::Number(tid),
            Amf0Value::Null,
            Amf0Value::Number(stream_id as f64),
        ],
    )
}

/// `releaseStream`, `FCPublish` and friends: name, tid, null, stream name.
pub fn stream_name_command(name: &str, tid: u32, stream_name: &str) -> Result<RtmpMessage> {
    command(
        csid::OVER_CONNECTION,
        0,
        &[
            str_value(name),
            Amf0Value::Number(tid as f64),
            Amf0Value::Null,
            str_value(stream_name),
        ],
    )
}

pub fn publish(tid: u32, stream_id: u32, stream_name: &str) -> Result<RtmpMessage> {
    command(
        csid::OVER_STREAM,
        stream_id,
        &[
            str_value(CMD_PUBLISH),
            Amf0Value::Number(tid as f64),
            Amf0Value::Null,
            str_value(stream_name),
            str_value("live"),
        ],
    )
}

pub fn play(tid: u32, stream_id: u32, stream_name: &str) -> Result<RtmpMessage> {
    command(
        csid::OVER_STREAM,
        stream_id,
        &[
            str_value(CMD_PLAY),
            Amf0Value::Number(tid as f64),
            Amf0Value::Null,
            str_value(stream_name),
        ],
    )
}

pub fn delete_stream(tid: u32, stream_id: u32) -> Result<RtmpMessage> {
    command(
        csid::OVER_CONNECTION,
        0,
        &[
            str_value(CMD_DELETE_STREAM),
            Amf0Value::Number(tid as f64),
            Amf0Value::Null,
            Amf0Value::Number(stream_id as f64),
        ],
    )
}

pub fn on_status(stream_id: u32, code: &str, description: &str) -> Result<RtmpMessage> {
    let info = Amf0Object::new()
        .with("level", "status")
        .with("code", code)
        .with("description", description);
    command(
        csid::OVER_STREAM,
        stream_id,
        &[str_value(CMD_ON_STATUS), Amf0Value::Number(0.0), Amf0Value::Null, info.into()],
    )
}

/// A decoded AMF0 (or AMF3-wrapped AMF0) command.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    /// Command object, absent when the peer sent null.
    pub object: Option<Amf0Object>,
    /// Values after the command object.
    pub args: Vec<Amf0Value>,
}

impl Command {
    pub fn parse(msg: &RtmpMessage) -> Result<Self> {
        let mut body: &[u8] = &msg.payload;
        // AMF3 commands carry a format selector byte before AMF0 values.
        if msg.header.msg_type_id == type_id::COMMAND_AMF3 && !body.is_empty() {
            body = &body[1..];
        }
        let mut values = amf0::decode(body)?.into_iter();
        let name = match values.next() {
            Some(Amf0Value::String(s)) => s,
            _ => return Err(Error::invalid(ProtocolErrorKind::UnexpectedCommand("missing name".into()))),
        };
        let transaction_id = values.next().and_then(|v| v.as_number()).unwrap_or(0.0);
        let object = match values.next() {
            Some(Amf0Value::Object(o)) | Some(Amf0Value::EcmaArray(o)) => Some(o),
            _ => None,
        };
        Ok(Self {
            name,
            transaction_id,
            object,
            args: values.collect(),
        })
    }

    pub fn arg_str(&self, i: usize) -> Option<&str> {
        self.args.get(i).and_then(Amf0Value::as_str)
    }

    pub fn arg_number(&self, i: usize) -> Option<f64> {
        self.args.get(i).and_then(Amf0Value::as_number)
    }

    pub fn arg_object(&self, i: usize) -> Option<&Amf0Object> {
        self.args.get(i).and_then(Amf0Value::as_object)
    }

    /// The `code` of an `onStatus` or `_result` info object.
    pub fn status_code(&self) -> Option<&str> {
        self.args
            .iter()
            .filter_map(Amf0Value::as_object)
            .find_map(|o| o.get_str("code"))
    }
}

/// Metadata payload with a leading `@setDataFrame` removed, as players
/// expect to receive it.
pub fn strip_set_data_frame(payload: &Bytes) -> Bytes {
    if payload.starts_with(SET_DATA_FRAME) {
        payload.slice(SET_DATA_FRAME.len()..)
    } else {
        payload.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_bodies() {
        let m = set_peer_bandwidth(5_000_000, PEER_BANDWIDTH_DYNAMIC);
        assert_eq!(m.header.csid, csid::PROTOCOL_CONTROL);
        assert_eq!(m.payload.as_ref(), &[0x00, 0x4C, 0x4B, 0x40, 2]);
        assert_eq!(parse_u32_body(&set_chunk_size(4096).payload).unwrap(), 4096);
        assert!(parse_u32_body(&[0, 1]).is_err());
        assert_eq!(parse_user_control(&ping_response(77).payload).unwrap(), (7, 77));
    }

    #[test]
    fn connect_round_trip() {
        let m = connect(1, "live", "rtmp://127.0.0.1/live", "FMLE/3.0", true).unwrap();
        let cmd = Command::parse(&m).unwrap();
        assert_eq!(cmd.name, CMD_CONNECT);
        assert_eq!(cmd.transaction_id, 1.0);
        let obj = cmd.object.unwrap();
        assert_eq!(obj.get_str("app"), Some("live"));
        assert_eq!(obj.get_str("type"), Some("nonprivate"));
        assert!(obj.get("fpad").is_none());
    }

    #[test]
    fn connect_result_carries_library_version() {
        let cmd = Command::parse(&connect_result(1.0, "streamcore/0.1.0").unwrap()).unwrap();
        assert_eq!(cmd.object.as_ref().unwrap().get_str("fmsVer"), Some(FMS_VERSION));
        assert_eq!(cmd.status_code(), Some(CODE_CONNECT_SUCCESS));
        assert_eq!(cmd.arg_object(0).unwrap().get_str("version"), Some("streamcore/0.1.0"));
    }

    #[test]
    fn publish_and_status() {
        let cmd = Command::parse(&publish(3, 1, "test").unwrap()).unwrap();
        assert!(cmd.object.is_none());
        assert_eq!(cmd.arg_str(0), Some("test"));
        assert_eq!(cmd.arg_str(1), Some("live"));

        let m = on_status(1, CODE_PUBLISH_START, "Start publishing").unwrap();
        assert_eq!(m.header.msg_stream_id, 1);
        assert_eq!(Command::parse(&m).unwrap().status_code(), Some(CODE_PUBLISH_START));

        let cmd = Command::parse(&create_stream_result(2.0, 1).unwrap()).unwrap();
        assert_eq!(cmd.arg_number(0), Some(1.0));
    }

    #[test]
    fn set_data_frame_is_stripped() {
        let body = amf0::encode(&[
            str_value("@setDataFrame"),
            str_value("onMetaData"),
            Amf0Value::EcmaArray(Amf0Object::new().with("width", 1280.0)),
        ])
        .unwrap();
        let stripped = strip_set_data_frame(&body);
        let values = amf0::decode(&stripped).unwrap();
        assert_eq!(values[0].as_str(), Some("onMetaData"));
        assert_eq!(strip_set_data_frame(&stripped), stripped);
    }
}

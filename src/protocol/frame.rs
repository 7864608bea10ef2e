//! Binary frame codec: spec §6.1.
//!
//! ```text
//! +----+----+----+----+----+----+----+-- ... --+-- ... --+
//! |ver |type| hdrLen  |      payloadLen        | hdrJSON | payload |
//! | u8 | u8 |  u16 BE |       u32 BE           |  UTF-8  |  bytes  |
//! +----+----+----+----+----+----+----+-- ... --+-- ... --+
//! ```

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::error::{GatewayError, Result};

pub const FRAME_VERSION: u8 = 1;
const HEADER_FIXED_LEN: usize = 1 + 1 + 2 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BinaryFrameType {
    Handshake = 0x00,
    Heartbeat = 0x01,
    Error = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    Connect = 0x05,
    Auth = 0x06,
    Disconnect = 0x07,
    Register = 0x08,
    Connected = 0x09,
    Latency = 0x0A,
    Status = 0x0B,
    SshData = 0x10,
    SshResize = 0x11,
    SshCmd = 0x12,
    SshAck = 0x13,
    SftpInit = 0x20,
    SftpList = 0x21,
    SftpUpload = 0x22,
    SftpDownload = 0x23,
    SftpMkdir = 0x24,
    SftpDelete = 0x25,
    SftpRename = 0x26,
    SftpChmod = 0x27,
    SftpDownloadFolder = 0x28,
    SftpClose = 0x29,
    SftpCancel = 0x2A,
    SftpOk = 0x80,
    SftpErr = 0x81,
    SftpProgress = 0x82,
    SftpFileData = 0x83,
    SftpFolderData = 0x84,
}

impl TryFrom<u8> for BinaryFrameType {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self> {
        use BinaryFrameType::*;
        Ok(match value {
            0x00 => Handshake,
            0x01 => Heartbeat,
            0x02 => Error,
            0x03 => Ping,
            0x04 => Pong,
            0x05 => Connect,
            0x06 => Auth,
            0x07 => Disconnect,
            0x08 => Register,
            0x09 => Connected,
            0x0A => Latency,
            0x0B => Status,
            0x10 => SshData,
            0x11 => SshResize,
            0x12 => SshCmd,
            0x13 => SshAck,
            0x20 => SftpInit,
            0x21 => SftpList,
            0x22 => SftpUpload,
            0x23 => SftpDownload,
            0x24 => SftpMkdir,
            0x25 => SftpDelete,
            0x26 => SftpRename,
            0x27 => SftpChmod,
            0x28 => SftpDownloadFolder,
            0x29 => SftpClose,
            0x2A => SftpCancel,
            0x80 => SftpOk,
            0x81 => SftpErr,
            0x82 => SftpProgress,
            0x83 => SftpFileData,
            0x84 => SftpFolderData,
            other => return Err(GatewayError::Protocol(format!("unknown frame type 0x{other:02x}"))),
        })
    }
}

/// A decoded binary frame: header JSON plus raw payload bytes.
#[derive(Clone, Debug)]
pub struct BinaryFrame {
    pub kind: BinaryFrameType,
    pub header: Value,
    pub payload: Bytes,
}

impl BinaryFrame {
    pub fn new(kind: BinaryFrameType, header: Value, payload: Bytes) -> Self {
        Self { kind, header, payload }
    }

    pub fn empty_header(kind: BinaryFrameType, payload: Bytes) -> Self {
        Self::new(kind, Value::Object(Default::default()), payload)
    }

    pub fn operation_id(&self) -> Option<&str> {
        self.header.get("operationId").and_then(Value::as_str)
    }

    pub fn encode(&self) -> Result<Bytes> {
        let header_bytes = serde_json::to_vec(&self.header)?;
        if header_bytes.len() < 2 {
            return Err(GatewayError::Protocol("header JSON shorter than 2 bytes".into()));
        }
        let header_len: u16 = header_bytes
            .len()
            .try_into()
            .map_err(|_| GatewayError::Protocol("header JSON too large".into()))?;
        let payload_len: u32 = self
            .payload
            .len()
            .try_into()
            .map_err(|_| GatewayError::Protocol("payload too large".into()))?;

        let mut buf = BytesMut::with_capacity(HEADER_FIXED_LEN + header_bytes.len() + self.payload.len());
        buf.extend_from_slice(&[FRAME_VERSION, self.kind as u8]);
        buf.extend_from_slice(&header_len.to_be_bytes());
        buf.extend_from_slice(&payload_len.to_be_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decodes one frame from `buf`. `max_payload` rejects the frame before
    /// any payload bytes are copied out (spec boundary property #10).
    pub fn decode(buf: &[u8], max_payload: u32) -> Result<Self> {
        if buf.len() < HEADER_FIXED_LEN {
            return Err(GatewayError::Protocol("frame shorter than header".into()));
        }
        let version = buf[0];
        if version != FRAME_VERSION {
            return Err(GatewayError::Protocol(format!("unsupported frame version {version}")));
        }
        let kind = BinaryFrameType::try_from(buf[1])?;
        let header_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if header_len < 2 {
            return Err(GatewayError::Protocol("header JSON shorter than 2 bytes".into()));
        }
        let payload_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if payload_len > max_payload {
            return Err(GatewayError::Protocol(format!(
                "payload {payload_len} exceeds cap {max_payload}"
            )));
        }

        let header_start = HEADER_FIXED_LEN;
        let header_end = header_start + header_len;
        let payload_end = header_end + payload_len as usize;
        if buf.len() < payload_end {
            return Err(GatewayError::Protocol("frame truncated".into()));
        }

        let header: Value = serde_json::from_slice(&buf[header_start..header_end])?;
        let payload = Bytes::copy_from_slice(&buf[header_end..payload_end]);

        Ok(Self { kind, header, payload })
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Protocol(format!("invalid header JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_empty_header() {
        let frame = BinaryFrame::empty_header(BinaryFrameType::SshData, Bytes::from_static(b"hello"));
        let encoded = frame.encode().unwrap();
        let decoded = BinaryFrame::decode(&encoded, 1 << 20).unwrap();
        assert_eq!(decoded.kind, BinaryFrameType::SshData);
        assert_eq!(decoded.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn round_trips_with_header_fields() {
        let header = json!({ "operationId": "op1", "seq": 3 });
        let frame = BinaryFrame::new(BinaryFrameType::SftpFileData, header, Bytes::from_static(b"data"));
        let encoded = frame.encode().unwrap();
        let decoded = BinaryFrame::decode(&encoded, 1 << 20).unwrap();
        assert_eq!(decoded.operation_id(), Some("op1"));
        assert_eq!(decoded.payload, Bytes::from_static(b"data"));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut encoded = BinaryFrame::empty_header(BinaryFrameType::Ping, Bytes::new())
            .encode()
            .unwrap()
            .to_vec();
        encoded[0] = 2;
        let err = BinaryFrame::decode(&encoded, 1 << 20).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[test]
    fn rejects_payload_above_cap_without_allocating() {
        let frame = BinaryFrame::empty_header(BinaryFrameType::SftpFileData, Bytes::from(vec![0u8; 1024]));
        let encoded = frame.encode().unwrap();
        let err = BinaryFrame::decode(&encoded, 100).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[test]
    fn rejects_unknown_type_code() {
        let mut encoded = BinaryFrame::empty_header(BinaryFrameType::Ping, Bytes::new())
            .encode()
            .unwrap()
            .to_vec();
        encoded[1] = 0xFF;
        let err = BinaryFrame::decode(&encoded, 1 << 20).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }
}

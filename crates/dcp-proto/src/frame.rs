//! Frame codec for the 24-byte-header binary protocol.
//!
//! Every message, in both directions, is a single frame:
//!
//! ```text
//! +-----------+-----------+-------------+-------------+
//! | magic (1) | opcode(1) | key len (2) | extras (1)  |
//! +-----------+-----------+-------------+-------------+
//! | dtype (1) | vbucket / status (2)    | body len(4) |
//! +-----------+-------------------------+-------------+
//! | opaque (4)            | cas (8)                   |
//! +-----------------------+---------------------------+
//! | extras .. | key .. | value ..                     |
//! +----------------------------------------------------+
//! ```
//!
//! All integers are big-endian. `body len` (at offset 8) covers extras +
//! key + value. Requests carry a vbucket id in the two bytes at offset 6;
//! responses reuse them for the status code.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::constants::*;
use crate::opcode::Opcode;
use crate::status::Status;

/// Frame-level decode errors. All of them are fatal for the connection
/// that produced the bytes.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad magic byte {0:#04x}")]
    BadMagic(u8),
    #[error("frame too large: max {max} got {got}")]
    FrameTooLarge { max: usize, got: usize },
    #[error("frame body inconsistent: {0}")]
    BodyInconsistent(String),
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub magic: u8,
    pub opcode: Opcode,
    pub datatype: u8,
    /// Vbucket id on requests, status code on responses.
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Frame {
    /// Build a request frame addressed to `vbucket`.
    pub fn request(opcode: Opcode, vbucket: u16, opaque: u32) -> Self {
        Self {
            magic: MAGIC_REQUEST,
            opcode,
            datatype: 0,
            vbucket_or_status: vbucket,
            opaque,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Build a response frame echoing `opaque`, as sent when replying to
    /// server-initiated requests (NOOP, unknown opcodes).
    pub fn response(opcode: Opcode, status: Status, opaque: u32) -> Self {
        Self {
            magic: MAGIC_RESPONSE,
            opcode,
            datatype: 0,
            vbucket_or_status: status.to_code(),
            opaque,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn with_extras(mut self, extras: Vec<u8>) -> Self {
        self.extras = extras;
        self
    }

    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = key;
        self
    }

    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    pub fn is_request(&self) -> bool {
        self.magic == MAGIC_REQUEST
    }

    pub fn is_response(&self) -> bool {
        self.magic == MAGIC_RESPONSE
    }

    /// Status code of a response frame.
    pub fn status(&self) -> Status {
        Status::from_code(self.vbucket_or_status)
    }

    /// Vbucket id of a request frame.
    pub fn vbucket(&self) -> u16 {
        self.vbucket_or_status
    }

    /// Total framed size (header + body). This is the unit the
    /// flow-control accounting charges.
    pub fn total_len(&self) -> usize {
        HEADER_SIZE + self.extras.len() + self.key.len() + self.value.len()
    }

    /// Encode into wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.extras.len() + self.key.len() + self.value.len();
        let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
        buf.push(self.magic);
        buf.push(self.opcode.to_u8());
        buf.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        buf.push(self.extras.len() as u8);
        buf.push(self.datatype);
        buf.extend_from_slice(&self.vbucket_or_status.to_be_bytes());
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        buf.extend_from_slice(&self.opaque.to_be_bytes());
        buf.extend_from_slice(&self.cas.to_be_bytes());
        buf.extend_from_slice(&self.extras);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        buf
    }

    /// Decode a frame from a complete header + body byte pair.
    pub fn decode(header: &[u8; HEADER_SIZE], body: Vec<u8>) -> Result<Self, FrameError> {
        let magic = header[0];
        if magic != MAGIC_REQUEST && magic != MAGIC_RESPONSE {
            return Err(FrameError::BadMagic(magic));
        }

        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extras_len = header[4] as usize;
        if extras_len + key_len > body.len() {
            return Err(FrameError::BodyInconsistent(format!(
                "extras {} + key {} exceed body {}",
                extras_len,
                key_len,
                body.len()
            )));
        }

        let extras = body[..extras_len].to_vec();
        let key = body[extras_len..extras_len + key_len].to_vec();
        let value = body[extras_len + key_len..].to_vec();

        Ok(Self {
            magic,
            opcode: Opcode::from_u8(header[1]),
            datatype: header[5],
            vbucket_or_status: u16::from_be_bytes([header[6], header[7]]),
            opaque: u32::from_be_bytes([header[12], header[13], header[14], header[15]]),
            cas: u64::from_be_bytes([
                header[16], header[17], header[18], header[19], header[20], header[21],
                header[22], header[23],
            ]),
            extras,
            key,
            value,
        })
    }
}

/// Read exactly one frame from `reader`.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary. An EOF in the
/// middle of a frame, a bad magic byte, or a body length above
/// `max_frame_bytes` is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<Frame>, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let body_len = u32::from_be_bytes([
        header[BODY_LENGTH_OFFSET],
        header[BODY_LENGTH_OFFSET + 1],
        header[BODY_LENGTH_OFFSET + 2],
        header[BODY_LENGTH_OFFSET + 3],
    ]) as usize;

    if HEADER_SIZE + body_len > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max: max_frame_bytes,
            got: HEADER_SIZE + body_len,
        });
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    Frame::decode(&header, body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let frame = Frame::request(Opcode::DcpStreamRequest, 42, 0xdeadbeef)
            .with_extras(vec![1, 2, 3, 4])
            .with_key(b"key".to_vec())
            .with_value(b"value".to_vec());

        let bytes = frame.encode();
        assert_eq!(bytes.len(), frame.total_len());

        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = read_frame(&mut cursor, MAX_FRAME_BYTES).await.unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let got = read_frame(&mut cursor, MAX_FRAME_BYTES).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_truncated_header_is_error() {
        let frame = Frame::request(Opcode::DcpNoop, 0, 1);
        let mut bytes = frame.encode();
        bytes.truncate(10);

        let mut cursor = std::io::Cursor::new(bytes);
        assert!(read_frame(&mut cursor, MAX_FRAME_BYTES).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_body_is_error() {
        let frame = Frame::request(Opcode::DcpMutation, 7, 1).with_value(vec![0u8; 100]);
        let mut bytes = frame.encode();
        bytes.truncate(HEADER_SIZE + 10);

        let mut cursor = std::io::Cursor::new(bytes);
        assert!(read_frame(&mut cursor, MAX_FRAME_BYTES).await.is_err());
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let frame = Frame::request(Opcode::DcpMutation, 7, 1).with_value(vec![0u8; 1000]);
        let bytes = frame.encode();

        let mut cursor = std::io::Cursor::new(bytes);
        let err = read_frame(&mut cursor, 512).await.unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_bad_magic_rejected() {
        let frame = Frame::request(Opcode::DcpNoop, 0, 1);
        let mut bytes = frame.encode();
        bytes[0] = 0x42;

        let mut cursor = std::io::Cursor::new(bytes);
        let err = read_frame(&mut cursor, MAX_FRAME_BYTES).await.unwrap_err();
        assert!(matches!(err, FrameError::BadMagic(0x42)));
    }

    #[test]
    fn test_status_and_vbucket_share_the_field() {
        let req = Frame::request(Opcode::DcpStreamRequest, 513, 9);
        assert_eq!(req.vbucket(), 513);

        let resp = Frame::response(Opcode::DcpStreamRequest, Status::Rollback, 9);
        assert_eq!(resp.status(), Status::Rollback);
    }
}

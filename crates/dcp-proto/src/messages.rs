//! Typed request builders and response/body parsers.
//!
//! Builders produce ready-to-encode [`Frame`]s; parsers pull the typed
//! payload out of a received frame. Extras layouts follow the DCP wire
//! documentation and must not be reordered.

use thiserror::Error;

use crate::constants::*;
use crate::features::FeatureSet;
use crate::frame::Frame;
use crate::opcode::Opcode;
use crate::status::Status;

/// Body/extras parse errors. A malformed body on a frame the client must
/// interpret is a protocol violation and fatal for the channel.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("extras too short for {opcode}: need {need} got {got}")]
    ShortExtras {
        opcode: Opcode,
        need: usize,
        got: usize,
    },
    #[error("body malformed for {opcode}: {reason}")]
    BadBody { opcode: Opcode, reason: String },
    #[error("leb128 varint malformed")]
    BadVarint,
}

fn take_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn take_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn take_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_be_bytes([
        buf[at],
        buf[at + 1],
        buf[at + 2],
        buf[at + 3],
        buf[at + 4],
        buf[at + 5],
        buf[at + 6],
        buf[at + 7],
    ])
}

fn need_extras(frame: &Frame, need: usize) -> Result<(), MessageError> {
    if frame.extras.len() < need {
        return Err(MessageError::ShortExtras {
            opcode: frame.opcode,
            need,
            got: frame.extras.len(),
        });
    }
    Ok(())
}

// ─── Request builders ─────────────────────────────────────────────────────────

/// HELLO with the client name as key and requested feature codes as value.
pub fn hello(opaque: u32, client_name: &str, features: &FeatureSet) -> Frame {
    Frame::request(Opcode::Hello, 0, opaque)
        .with_key(client_name.as_bytes().to_vec())
        .with_value(features.encode())
}

pub fn sasl_list_mechs(opaque: u32) -> Frame {
    Frame::request(Opcode::SaslListMechs, 0, opaque)
}

/// SASL PLAIN: authzid NUL authcid NUL passwd.
pub fn sasl_auth_plain(opaque: u32, username: &str, password: &str) -> Frame {
    let mut value = Vec::with_capacity(username.len() + password.len() + 2);
    value.push(0);
    value.extend_from_slice(username.as_bytes());
    value.push(0);
    value.extend_from_slice(password.as_bytes());

    Frame::request(Opcode::SaslAuth, 0, opaque)
        .with_key(b"PLAIN".to_vec())
        .with_value(value)
}

pub fn select_bucket(opaque: u32, bucket: &str) -> Frame {
    Frame::request(Opcode::SelectBucket, 0, opaque).with_key(bucket.as_bytes().to_vec())
}

/// DCP_OPEN_CONNECTION for a producer stream. Extras: seqno (reserved,
/// always 0) then flags.
pub fn open_connection(opaque: u32, connection_name: &str) -> Frame {
    let mut extras = Vec::with_capacity(8);
    extras.extend_from_slice(&0u32.to_be_bytes());
    extras.extend_from_slice(&OPEN_CONNECTION_FLAG_PRODUCER.to_be_bytes());

    Frame::request(Opcode::DcpOpenConnection, 0, opaque)
        .with_extras(extras)
        .with_key(connection_name.as_bytes().to_vec())
}

/// DCP_CONTROL key/value switch.
pub fn control(opaque: u32, key: &str, value: &str) -> Frame {
    Frame::request(Opcode::DcpControl, 0, opaque)
        .with_key(key.as_bytes().to_vec())
        .with_value(value.as_bytes().to_vec())
}

/// The resume tuple sent when opening a vbucket stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub vbuuid: u64,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub snapshot_start: u64,
    pub snapshot_end: u64,
}

/// DCP_STREAM_REQUEST. Extras: flags, reserved, start, end, vbuuid,
/// snapshot start, snapshot end (48 bytes). An optional collections
/// filter rides in the value as JSON.
pub fn stream_request(
    opaque: u32,
    vbucket: u16,
    req: StreamRequest,
    filter_json: Option<&str>,
) -> Frame {
    let mut extras = Vec::with_capacity(48);
    extras.extend_from_slice(&0u32.to_be_bytes()); // flags
    extras.extend_from_slice(&0u32.to_be_bytes()); // reserved
    extras.extend_from_slice(&req.start_seqno.to_be_bytes());
    extras.extend_from_slice(&req.end_seqno.to_be_bytes());
    extras.extend_from_slice(&req.vbuuid.to_be_bytes());
    extras.extend_from_slice(&req.snapshot_start.to_be_bytes());
    extras.extend_from_slice(&req.snapshot_end.to_be_bytes());

    let mut frame = Frame::request(Opcode::DcpStreamRequest, vbucket, opaque).with_extras(extras);
    if let Some(filter) = filter_json {
        frame = frame.with_value(filter.as_bytes().to_vec());
    }
    frame
}

pub fn close_stream(opaque: u32, vbucket: u16) -> Frame {
    Frame::request(Opcode::DcpCloseStream, vbucket, opaque)
}

pub fn get_failover_log(opaque: u32, vbucket: u16) -> Frame {
    Frame::request(Opcode::DcpGetFailoverLog, vbucket, opaque)
}

/// GET_ALL_VB_SEQNOS, optionally filtered to active vbuckets only
/// (state 1). Used to capture "NOW" bounds.
pub fn get_all_vb_seqnos(opaque: u32) -> Frame {
    let mut extras = Vec::with_capacity(4);
    extras.extend_from_slice(&1u32.to_be_bytes()); // vbucket state: active
    Frame::request(Opcode::GetAllVbSeqnos, 0, opaque).with_extras(extras)
}

/// OBSERVE_SEQNO: vbuuid in the value, vbucket in the header.
pub fn observe_seqno(opaque: u32, vbucket: u16, vbuuid: u64) -> Frame {
    Frame::request(Opcode::ObserveSeqno, vbucket, opaque).with_value(vbuuid.to_be_bytes().to_vec())
}

pub fn get_cluster_config(opaque: u32) -> Frame {
    Frame::request(Opcode::GetClusterConfig, 0, opaque)
}

/// DCP_BUFFER_ACK carrying the byte count being credited back.
pub fn buffer_ack(opaque: u32, ack_bytes: u32) -> Frame {
    Frame::request(Opcode::DcpBufferAck, 0, opaque)
        .with_extras(ack_bytes.to_be_bytes().to_vec())
}

/// Reply to a server-initiated DCP_NOOP.
pub fn noop_reply(opaque: u32) -> Frame {
    Frame::response(Opcode::DcpNoop, Status::Success, opaque)
}

/// Reply sent for server-initiated requests with opcodes this client
/// does not implement.
pub fn not_supported_reply(opcode: Opcode, opaque: u32) -> Frame {
    Frame::response(opcode, Status::NotSupported, opaque)
}

// ─── Response / body parsers ─────────────────────────────────────────────────

/// One failover log entry: the vbucket generation and the first seqno
/// of that generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverEntry {
    pub vbuuid: u64,
    pub seqno: u64,
}

/// A failover log, newest entry first, as returned by stream-request
/// success responses and GET_FAILOVER_LOG.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverLog {
    pub entries: Vec<FailoverEntry>,
}

impl FailoverLog {
    /// Parse from a body of (vbuuid, seqno) u64 pairs.
    pub fn parse(body: &[u8]) -> Result<Self, MessageError> {
        if body.len() % 16 != 0 {
            return Err(MessageError::BadBody {
                opcode: Opcode::DcpGetFailoverLog,
                reason: format!("length {} not a multiple of 16", body.len()),
            });
        }
        let entries = body
            .chunks_exact(16)
            .map(|chunk| FailoverEntry {
                vbuuid: take_u64(chunk, 0),
                seqno: take_u64(chunk, 8),
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn newest(&self) -> Option<&FailoverEntry> {
        self.entries.first()
    }
}

/// Rollback responses carry the seqno to rewind to as an 8-byte value.
pub fn parse_rollback_seqno(frame: &Frame) -> Result<u64, MessageError> {
    if frame.value.len() < 8 {
        return Err(MessageError::BadBody {
            opcode: frame.opcode,
            reason: format!("rollback body {} bytes, need 8", frame.value.len()),
        });
    }
    Ok(take_u64(&frame.value, 0))
}

/// Snapshot marker: the bounds of the batch of mutations that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMarker {
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

impl SnapshotMarker {
    pub fn parse(frame: &Frame) -> Result<Self, MessageError> {
        need_extras(frame, 20)?;
        Ok(Self {
            start_seqno: take_u64(&frame.extras, 0),
            end_seqno: take_u64(&frame.extras, 8),
            flags: take_u32(&frame.extras, 16),
        })
    }

    pub fn is_disk(&self) -> bool {
        self.flags & SNAPSHOT_FLAG_DISK != 0
    }

    pub fn is_memory(&self) -> bool {
        self.flags & SNAPSHOT_FLAG_MEMORY != 0
    }
}

/// Parsed DCP_MUTATION payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBody {
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub flags: u32,
    pub expiry: u32,
    pub lock_time: u32,
    /// Collection id split off the key when collections are negotiated.
    pub collection_id: u32,
    pub key: Vec<u8>,
    pub content: Vec<u8>,
    pub cas: u64,
    pub datatype: u8,
}

impl MutationBody {
    /// Extras: by_seqno, rev_seqno, flags, expiration, lock_time,
    /// metadata length, NRU (31 bytes).
    pub fn parse(frame: &Frame, collections: bool) -> Result<Self, MessageError> {
        need_extras(frame, 28)?;
        let (collection_id, key) = split_key(&frame.key, collections)?;
        Ok(Self {
            by_seqno: take_u64(&frame.extras, 0),
            rev_seqno: take_u64(&frame.extras, 8),
            flags: take_u32(&frame.extras, 16),
            expiry: take_u32(&frame.extras, 20),
            lock_time: take_u32(&frame.extras, 24),
            collection_id,
            key,
            content: frame.value.clone(),
            cas: frame.cas,
            datatype: frame.datatype,
        })
    }
}

/// Parsed DCP_DELETION / DCP_EXPIRATION payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionBody {
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub collection_id: u32,
    pub key: Vec<u8>,
    pub cas: u64,
}

impl DeletionBody {
    /// Extras: by_seqno, rev_seqno, then metadata length or delete time
    /// depending on negotiation; only the seqnos are interpreted.
    pub fn parse(frame: &Frame, collections: bool) -> Result<Self, MessageError> {
        need_extras(frame, 16)?;
        let (collection_id, key) = split_key(&frame.key, collections)?;
        Ok(Self {
            by_seqno: take_u64(&frame.extras, 0),
            rev_seqno: take_u64(&frame.extras, 8),
            collection_id,
            key,
            cas: frame.cas,
        })
    }
}

/// Scope/collection lifecycle events carried by DCP_SYSTEM_EVENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEventKind {
    CollectionCreated,
    CollectionDropped,
    CollectionFlushed,
    ScopeCreated,
    ScopeDropped,
    Other(u32),
}

impl SystemEventKind {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x00 => Self::CollectionCreated,
            0x01 => Self::CollectionDropped,
            0x02 => Self::CollectionFlushed,
            0x03 => Self::ScopeCreated,
            0x04 => Self::ScopeDropped,
            other => Self::Other(other),
        }
    }
}

/// Parsed DCP_SYSTEM_EVENT payload.
///
/// The value layout varies by event and version; the ids shared by all
/// versions (manifest uid, scope id, collection id where applicable)
/// are extracted, the rest is kept raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemEventBody {
    pub seqno: u64,
    pub kind: SystemEventKind,
    pub version: u8,
    pub manifest_uid: u64,
    pub scope_id: u32,
    pub collection_id: Option<u32>,
    /// Event subject name (scope or collection name), from the key.
    pub name: String,
}

impl SystemEventBody {
    /// Extras: seqno (8), event id (4), version (1).
    pub fn parse(frame: &Frame) -> Result<Self, MessageError> {
        need_extras(frame, 13)?;
        let seqno = take_u64(&frame.extras, 0);
        let kind = SystemEventKind::from_code(take_u32(&frame.extras, 8));
        let version = frame.extras[12];

        let value = &frame.value;
        if value.len() < 12 {
            return Err(MessageError::BadBody {
                opcode: Opcode::DcpSystemEvent,
                reason: format!("system event value {} bytes, need 12", value.len()),
            });
        }
        let manifest_uid = take_u64(value, 0);
        let scope_id = take_u32(value, 8);
        let collection_id = match kind {
            SystemEventKind::ScopeCreated | SystemEventKind::ScopeDropped => None,
            _ if value.len() >= 16 => Some(take_u32(value, 12)),
            _ => None,
        };

        Ok(Self {
            seqno,
            kind,
            version,
            manifest_uid,
            scope_id,
            collection_id,
            name: String::from_utf8_lossy(&frame.key).into_owned(),
        })
    }
}

/// OSO snapshot boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsoBoundary {
    Start,
    End,
}

/// Parse the DCP_OSO_SNAPSHOT flags word.
pub fn parse_oso_snapshot(frame: &Frame) -> Result<OsoBoundary, MessageError> {
    need_extras(frame, 4)?;
    let flags = take_u32(&frame.extras, 0);
    if flags & OSO_SNAPSHOT_START != 0 {
        Ok(OsoBoundary::Start)
    } else if flags & OSO_SNAPSHOT_END != 0 {
        Ok(OsoBoundary::End)
    } else {
        Err(MessageError::BadBody {
            opcode: Opcode::DcpOsoSnapshot,
            reason: format!("flags {:#x} neither start nor end", flags),
        })
    }
}

/// Parse DCP_SEQNO_ADVANCED extras (the advanced-to seqno).
pub fn parse_seqno_advanced(frame: &Frame) -> Result<u64, MessageError> {
    need_extras(frame, 8)?;
    Ok(take_u64(&frame.extras, 0))
}

/// Why the server ended a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    Ok,
    Closed,
    StateChanged,
    Disconnected,
    TooSlow,
    BackfillFail,
    Rollback,
    FilterEmpty,
    LostPrivileges,
    /// Synthesized client-side when the channel carrying the stream dies.
    ChannelDropped,
    Other(u32),
}

impl StreamEndReason {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x00 => Self::Ok,
            0x01 => Self::Closed,
            0x02 => Self::StateChanged,
            0x03 => Self::Disconnected,
            0x04 => Self::TooSlow,
            0x05 => Self::BackfillFail,
            0x06 => Self::Rollback,
            0x07 => Self::FilterEmpty,
            0x08 => Self::LostPrivileges,
            other => Self::Other(other),
        }
    }

    /// OK means the requested range completed; everything else is a
    /// candidate for automatic reopen.
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Parse the DCP_STREAM_END reason from the extras flags.
pub fn parse_stream_end(frame: &Frame) -> Result<StreamEndReason, MessageError> {
    need_extras(frame, 4)?;
    Ok(StreamEndReason::from_code(take_u32(&frame.extras, 0)))
}

/// Parsed OBSERVE_SEQNO response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveSeqnoBody {
    /// Nonzero when the vbucket has failed over since the observed uuid.
    pub format_type: u8,
    pub vbucket: u16,
    pub vbuuid: u64,
    pub persisted_seqno: u64,
    pub current_seqno: u64,
}

impl ObserveSeqnoBody {
    pub fn parse(frame: &Frame) -> Result<Self, MessageError> {
        let value = &frame.value;
        if value.len() < 27 {
            return Err(MessageError::BadBody {
                opcode: Opcode::ObserveSeqno,
                reason: format!("observe body {} bytes, need 27", value.len()),
            });
        }
        Ok(Self {
            format_type: value[0],
            vbucket: take_u16(value, 1),
            vbuuid: take_u64(value, 3),
            persisted_seqno: take_u64(value, 11),
            current_seqno: take_u64(value, 19),
        })
    }
}

/// Parse a GET_ALL_VB_SEQNOS response body: (vbid, seqno) pairs.
pub fn parse_vb_seqnos(body: &[u8]) -> Result<Vec<(u16, u64)>, MessageError> {
    if body.len() % 10 != 0 {
        return Err(MessageError::BadBody {
            opcode: Opcode::GetAllVbSeqnos,
            reason: format!("length {} not a multiple of 10", body.len()),
        });
    }
    Ok(body
        .chunks_exact(10)
        .map(|chunk| (take_u16(chunk, 0), take_u64(chunk, 2)))
        .collect())
}

// ─── Collection-qualified keys ────────────────────────────────────────────────

/// Split the leb128 collection-id prefix off a key. With collections
/// disabled the key passes through under the default collection (0).
pub fn split_key(key: &[u8], collections: bool) -> Result<(u32, Vec<u8>), MessageError> {
    if !collections {
        return Ok((0, key.to_vec()));
    }
    let (cid, used) = decode_leb128(key)?;
    Ok((cid, key[used..].to_vec()))
}

/// Prefix a key with its collection id, unsigned LEB128.
pub fn encode_cid_key(cid: u32, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 5);
    let mut value = cid;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out.extend_from_slice(key);
    out
}

fn decode_leb128(buf: &[u8]) -> Result<(u32, usize), MessageError> {
    let mut result: u32 = 0;
    let mut shift = 0;
    for (i, byte) in buf.iter().enumerate() {
        if shift >= 32 {
            return Err(MessageError::BadVarint);
        }
        result |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }
    Err(MessageError::BadVarint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_log_parse() {
        let mut body = Vec::new();
        body.extend_from_slice(&0xaabb_u64.to_be_bytes());
        body.extend_from_slice(&100u64.to_be_bytes());
        body.extend_from_slice(&0x1122_u64.to_be_bytes());
        body.extend_from_slice(&0u64.to_be_bytes());

        let log = FailoverLog::parse(&body).unwrap();
        assert_eq!(log.entries.len(), 2);
        assert_eq!(log.newest().unwrap().vbuuid, 0xaabb);
        assert_eq!(log.entries[1].seqno, 0);
    }

    #[test]
    fn test_failover_log_rejects_ragged_body() {
        assert!(FailoverLog::parse(&[0u8; 15]).is_err());
    }

    #[test]
    fn test_stream_request_extras_layout() {
        let req = StreamRequest {
            vbuuid: 0x1111,
            start_seqno: 5,
            end_seqno: SEQNO_INFINITY,
            snapshot_start: 4,
            snapshot_end: 9,
        };
        let frame = stream_request(7, 42, req, None);
        assert_eq!(frame.extras.len(), 48);
        assert_eq!(frame.vbucket(), 42);
        // start at offset 8, vbuuid at 24, snap_start at 32
        assert_eq!(take_u64(&frame.extras, 8), 5);
        assert_eq!(take_u64(&frame.extras, 16), SEQNO_INFINITY);
        assert_eq!(take_u64(&frame.extras, 24), 0x1111);
        assert_eq!(take_u64(&frame.extras, 32), 4);
        assert_eq!(take_u64(&frame.extras, 40), 9);
    }

    #[test]
    fn test_snapshot_marker_parse() {
        let mut extras = Vec::new();
        extras.extend_from_slice(&10u64.to_be_bytes());
        extras.extend_from_slice(&20u64.to_be_bytes());
        extras.extend_from_slice(&SNAPSHOT_FLAG_DISK.to_be_bytes());
        let frame =
            Frame::request(Opcode::DcpSnapshotMarker, 3, 1).with_extras(extras);

        let marker = SnapshotMarker::parse(&frame).unwrap();
        assert_eq!(marker.start_seqno, 10);
        assert_eq!(marker.end_seqno, 20);
        assert!(marker.is_disk());
        assert!(!marker.is_memory());
    }

    #[test]
    fn test_mutation_parse_with_collections() {
        let mut extras = Vec::new();
        extras.extend_from_slice(&77u64.to_be_bytes());
        extras.extend_from_slice(&3u64.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&[0, 0, 0]); // nmeta + nru

        let frame = Frame::request(Opcode::DcpMutation, 9, 2)
            .with_extras(extras)
            .with_key(encode_cid_key(8, b"doc-1"))
            .with_value(b"{}".to_vec());

        let mutation = MutationBody::parse(&frame, true).unwrap();
        assert_eq!(mutation.by_seqno, 77);
        assert_eq!(mutation.rev_seqno, 3);
        assert_eq!(mutation.collection_id, 8);
        assert_eq!(mutation.key, b"doc-1");
        assert_eq!(mutation.content, b"{}");
    }

    #[test]
    fn test_mutation_short_extras_rejected() {
        let frame = Frame::request(Opcode::DcpMutation, 9, 2).with_extras(vec![0u8; 8]);
        assert!(MutationBody::parse(&frame, false).is_err());
    }

    #[test]
    fn test_stream_end_reason_codes() {
        let frame = Frame::request(Opcode::DcpStreamEnd, 1, 5)
            .with_extras(0x02u32.to_be_bytes().to_vec());
        assert_eq!(parse_stream_end(&frame).unwrap(), StreamEndReason::StateChanged);
        assert!(!StreamEndReason::StateChanged.is_ok());
        assert!(StreamEndReason::Ok.is_ok());
        assert_eq!(StreamEndReason::from_code(0x7f), StreamEndReason::Other(0x7f));
    }

    #[test]
    fn test_observe_seqno_parse() {
        let mut value = vec![0u8];
        value.extend_from_slice(&12u16.to_be_bytes());
        value.extend_from_slice(&0xfeed_u64.to_be_bytes());
        value.extend_from_slice(&50u64.to_be_bytes());
        value.extend_from_slice(&60u64.to_be_bytes());
        let frame = Frame::request(Opcode::ObserveSeqno, 12, 1).with_value(value);

        let body = ObserveSeqnoBody::parse(&frame).unwrap();
        assert_eq!(body.vbucket, 12);
        assert_eq!(body.vbuuid, 0xfeed);
        assert_eq!(body.persisted_seqno, 50);
        assert_eq!(body.current_seqno, 60);
    }

    #[test]
    fn test_vb_seqnos_parse() {
        let mut body = Vec::new();
        for vb in 0u16..4 {
            body.extend_from_slice(&vb.to_be_bytes());
            body.extend_from_slice(&(u64::from(vb) * 10).to_be_bytes());
        }
        let pairs = parse_vb_seqnos(&body).unwrap();
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[3], (3, 30));
    }

    #[test]
    fn test_leb128_key_roundtrip() {
        for cid in [0u32, 1, 127, 128, 300, 0xffff, u32::MAX] {
            let prefixed = encode_cid_key(cid, b"k");
            let (got, key) = split_key(&prefixed, true).unwrap();
            assert_eq!(got, cid);
            assert_eq!(key, b"k");
        }
    }

    #[test]
    fn test_system_event_parse() {
        let mut extras = Vec::new();
        extras.extend_from_slice(&200u64.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes()); // collection created
        extras.push(0);

        let mut value = Vec::new();
        value.extend_from_slice(&7u64.to_be_bytes()); // manifest uid
        value.extend_from_slice(&0u32.to_be_bytes()); // scope id
        value.extend_from_slice(&9u32.to_be_bytes()); // collection id

        let frame = Frame::request(Opcode::DcpSystemEvent, 4, 1)
            .with_extras(extras)
            .with_key(b"widgets".to_vec())
            .with_value(value);

        let event = SystemEventBody::parse(&frame).unwrap();
        assert_eq!(event.seqno, 200);
        assert_eq!(event.kind, SystemEventKind::CollectionCreated);
        assert_eq!(event.manifest_uid, 7);
        assert_eq!(event.collection_id, Some(9));
        assert_eq!(event.name, "widgets");
    }

    #[test]
    fn test_sasl_plain_layout() {
        let frame = sasl_auth_plain(1, "user", "pass");
        assert_eq!(frame.key, b"PLAIN");
        assert_eq!(frame.value, b"\0user\0pass");
    }

    #[test]
    fn test_oso_snapshot_flags() {
        let start = Frame::request(Opcode::DcpOsoSnapshot, 0, 1)
            .with_extras(OSO_SNAPSHOT_START.to_be_bytes().to_vec());
        assert_eq!(parse_oso_snapshot(&start).unwrap(), OsoBoundary::Start);

        let bad = Frame::request(Opcode::DcpOsoSnapshot, 0, 1)
            .with_extras(0u32.to_be_bytes().to_vec());
        assert!(parse_oso_snapshot(&bad).is_err());
    }
}

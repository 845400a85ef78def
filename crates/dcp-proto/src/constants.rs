/// DCP protocol and framing constants.

/// Fixed header size for every request and response frame.
pub const HEADER_SIZE: usize = 24;

/// Offset of the 4-byte big-endian total body length within the header.
pub const BODY_LENGTH_OFFSET: usize = 8;

/// Magic byte for client-to-server and server-initiated requests.
pub const MAGIC_REQUEST: u8 = 0x80;
/// Magic byte for responses.
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Default memcached/KV service port.
pub const KV_LISTEN_PORT: u16 = 11210;

/// Default cap on a single frame body (20 MiB plus header slack).
/// Protects against corrupt length fields.
pub const MAX_FRAME_BYTES: usize = 20 * 1024 * 1024 + HEADER_SIZE;

/// Stream end sequence number meaning "no end" (stream forever).
pub const SEQNO_INFINITY: u64 = u64::MAX;

/// Servers keep at most this many failover log entries per vbucket.
pub const FAILOVER_LOG_MAX_ENTRIES: usize = 25;

/// Partition count for a standard bucket. The authoritative value comes
/// from the bucket config; this is the conventional default.
pub const DEFAULT_NUM_VBUCKETS: u16 = 1024;

/// DCP_OPEN_CONNECTION flag requesting a producer connection.
pub const OPEN_CONNECTION_FLAG_PRODUCER: u32 = 0x01;

/// Snapshot marker flag bits.
pub const SNAPSHOT_FLAG_MEMORY: u32 = 0x01;
pub const SNAPSHOT_FLAG_DISK: u32 = 0x02;
pub const SNAPSHOT_FLAG_CHECKPOINT: u32 = 0x04;
pub const SNAPSHOT_FLAG_ACK: u32 = 0x08;

/// OSO snapshot flag bits.
pub const OSO_SNAPSHOT_START: u32 = 0x01;
pub const OSO_SNAPSHOT_END: u32 = 0x02;

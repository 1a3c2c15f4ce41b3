//! A reliable-UDP transport for a voxel game network protocol.
//! The protocol is a thin connection-oriented layer above UDP with a
//! client-server peer relationship.
//!
//! Every connection carries three independent channels. A packet sent on a
//! channel is either unreliable (may be dropped, duplicated or reordered) or
//! reliable (retransmitted until acknowledged and delivered in send order
//! relative to other reliable packets on the same channel). Payloads larger
//! than a single datagram are split into chunks and reassembled by the
//! receiver.
//!
//! UDP datagram format (big endian):
//!
//! ```text
//! proto_id: u32
//! src peer id: u16
//! channel: u8   // must be < CHANNEL_COUNT
//! raw pkt...
//! ```
//!
//! Use [`client::Client`] (or [`client::connect`] with an already connected
//! socket) on the client side and [`server::ListenerParameters`] (or
//! [`server::listen`]) on the server side. Both produce [`Conn`] values with
//! identical behavior.

use std::{
    fmt,
    io::{
        self,
        Cursor,
        Read,
    },
    sync::Arc,
    time::Duration,
};

pub mod client;
mod conn;
pub mod server;

pub use client::connect;
pub use conn::{
    AckWait,
    Conn,
};
pub use server::listen;

/// Peer ids are transmitted in every datagram header for backward
/// compatibility, but peers are actually identified by address and port.
pub type PeerId = u16;

/// Used by clients before the server assigns their id.
pub const PEER_ID_NIL: PeerId = 0;
/// The server always has this id.
pub const PEER_ID_SRV: PeerId = 1;
/// Lowest id a listener may assign to a client.
pub const PEER_ID_CLT_MIN: PeerId = 2;

/// Channel id type. Must be less than [`CHANNEL_COUNT`].
pub type Channel = u8;

/// Number of channels per connection.
pub const CHANNEL_COUNT: Channel = 3;

/// Must be at the start of every UDP datagram.
pub(crate) const PROTO_ID: u32 = 0x4f457403;

/// Hard cap on the size of a single UDP datagram.
pub const MAX_NET_PKT_SIZE: usize = 512;

// proto id + src peer id + channel number
pub(crate) const NET_HDR_SIZE: usize = 4 + 2 + 1;

// raw type
pub(crate) const ORIG_HDR_SIZE: usize = 1;

// raw type + seqnum + chunk count + chunk index
pub(crate) const SPLIT_HDR_SIZE: usize = 1 + 2 + 2 + 2;

// raw type + seqnum
pub(crate) const REL_HDR_SIZE: usize = 1 + 2;

/// Largest payload that can be sent unreliably, via splitting.
pub const MAX_UNREL_PKT_SIZE: usize =
    (MAX_NET_PKT_SIZE - NET_HDR_SIZE - SPLIT_HDR_SIZE) * u16::MAX as usize;

/// Largest payload that can be sent reliably, via splitting.
pub const MAX_REL_PKT_SIZE: usize =
    (MAX_NET_PKT_SIZE - NET_HDR_SIZE - REL_HDR_SIZE - SPLIT_HDR_SIZE) * u16::MAX as usize;

/// A connection that receives no datagram for this long is closed with
/// [`Error::TimedOut`].
pub const CONN_TIMEOUT: Duration = Duration::from_secs(30);

/// After this much outbound silence a ping is sent to prevent timeout.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const REL_RESEND_AFTER: Duration = Duration::from_millis(500);

/// Seqnums maintain reliable packet order and identify split packets.
/// Arithmetic wraps around.
pub(crate) type Seqnum = u16;

pub(crate) const INIT_SEQNUM: Seqnum = 65500;

/// Whether `sn` lies in the half-space window starting at `base`.
/// Seqnums behind the window are retransmissions of old packets.
pub(crate) fn in_half_window(base: Seqnum, sn: Seqnum) -> bool {
    sn.wrapping_sub(base) < 0x8000
}

pub(crate) struct RawType;

#[rustfmt::skip]
impl RawType {
    pub(crate) const CTL: u8 = 0;
        // CtlType...

    pub(crate) const ORIG: u8 = 1;
        // data...

    pub(crate) const SPLIT: u8 = 2;
        // seqnum: u16,
        // chunk_count: u16,
        // chunk_index: u16,
        // data...

    pub(crate) const REL: u8 = 3;
        // seqnum: u16,
        // nested raw pkt...
}

pub(crate) struct CtlType;

#[rustfmt::skip]
impl CtlType {
    pub(crate) const ACK: u8 = 0;
        // seqnum: u16,

    pub(crate) const SET_PEER_ID: u8 = 1;
        // peer id: u16,

    pub(crate) const PING: u8 = 2;

    pub(crate) const DISCO: u8 = 3;
}

/// Channel and reliability of a packet, in both directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PktInfo {
    pub channel: Channel,
    /// Unreliable packets may be dropped, duplicated or reordered.
    pub unrel: bool,
}

/// A user packet. Reliable packets on one channel are received in the order
/// they were sent in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pkt {
    pub data: Vec<u8>,
    pub info: PktInfo,
}

/// The error type returned by connection and listener methods and surfaced
/// on the per-connection error queue.
#[derive(Debug, Clone)]
pub enum Error {
    /// IO error wrapper.
    Io(Arc<io::Error>),
    /// The connection or listener is closed.
    Closed,
    /// No datagram was received for [`CONN_TIMEOUT`].
    TimedOut,
    /// The whole 16-bit peer id space is in use.
    OutOfPeerIds,
    /// The payload does not fit in the 16-bit chunk count space.
    PktTooLong,
    ChannelOutOfRange(Channel),
    UnsupportedProtoId(u32),
    UnsupportedRawType(u8),
    UnsupportedCtlType(u8),
    /// The remote id of a connection can only be assigned once.
    PeerIdAlreadySet,
    BadChunkIndex { index: u16, count: u16 },
    /// The chunk count of an incoming split packet changed between chunks.
    ChunkCountMismatch { was: u16, now: u16 },
    /// Trailing bytes after a well-formed control packet. A warning only,
    /// the packet itself was processed.
    TrailingData(Vec<u8>),
    UnexpectedEof,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::Closed => f.write_str("closed"),
            Error::TimedOut => f.write_str("timed out"),
            Error::OutOfPeerIds => f.write_str("out of peer ids"),
            Error::PktTooLong => f.write_str("can't send pkt: too big"),
            Error::ChannelOutOfRange(channel) => {
                write!(f, "invalid channel number: {}: >= CHANNEL_COUNT", channel)
            },
            Error::UnsupportedProtoId(id) => write!(f, "unsupported protocol id: 0x{:08x}", id),
            Error::UnsupportedRawType(t) => write!(f, "unsupported pkt type: {}", t),
            Error::UnsupportedCtlType(t) => write!(f, "unsupported ctl type: {}", t),
            Error::PeerIdAlreadySet => f.write_str("peer id already set"),
            Error::BadChunkIndex { index, count } => {
                write!(f, "chunk index ({}) >= chunk count ({})", index, count)
            },
            Error::ChunkCountMismatch { was, now } => {
                write!(f, "chunk count changed from {} to {}", was, now)
            },
            Error::TrailingData(data) => {
                f.write_str("trailing data:")?;
                for byte in data {
                    write!(f, " {:02x}", byte)?;
                }
                Ok(())
            },
            Error::UnexpectedEof => f.write_str("unexpected end of pkt"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(from: io::Error) -> Self {
        Self::Io(Arc::new(from))
    }
}

pub(crate) fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    let mut buf = [0; 1];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| Error::UnexpectedEof)?;
    Ok(buf[0])
}

pub(crate) fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, Error> {
    let mut buf = [0; 2];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| Error::UnexpectedEof)?;
    Ok(u16::from_be_bytes(buf))
}

pub(crate) fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, Error> {
    let mut buf = [0; 4];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| Error::UnexpectedEof)?;
    Ok(u32::from_be_bytes(buf))
}

/// Reports bytes left unconsumed after the expected fields of a packet.
pub(crate) fn check_trailing(cursor: &Cursor<&[u8]>) -> Result<(), Error> {
    let pos = cursor.position() as usize;
    let data = cursor.get_ref();
    if pos < data.len() {
        return Err(Error::TrailingData(data[pos ..].to_vec()));
    }
    Ok(())
}

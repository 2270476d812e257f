//! Cutting a byte stream into packets.
//!
//! Every packet carries its routing header next to the serialized message: the message op code, the rpc id
//! pairing a response with its request, and the route id of the process the message is addressed to. The
//! [`PacketFramer`] owns how that header is laid out on the wire.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// Size of the [`LengthPrefixedFramer`] header in bytes.
pub const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Op code of the message in `payload`.
    pub op_code: u32,
    /// Rpc id pairing a response with its request, `0` if none.
    pub rpc_id: u32,
    /// Route id the message is addressed to.
    pub route_id: u64,
    /// The serialized message.
    pub payload: Bytes,
}

/// Packs outgoing packets and extracts incoming ones from an accumulated buffer.
pub trait PacketFramer: Send + Sync + 'static {
    /// Appends one frame to `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving `dst` untouched, if the peer's framer would reject the frame.
    fn pack(
        &self,
        rpc_id: u32,
        op_code: u32,
        route_id: u64,
        payload: &[u8],
        dst: &mut BytesMut,
    ) -> Result<(), FrameError>;

    /// Removes one complete frame from the front of `src`.
    ///
    /// Returns `Ok(None)` and leaves `src` untouched when it does not yet hold a complete frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes at the front of `src` can never form a valid frame. The stream cannot be
    /// resynchronized after that.
    fn try_unpack(&self, src: &mut BytesMut) -> Result<Option<Packet>, FrameError>;
}

/// The default framer.
///
/// Layout, all integers little-endian:
///
/// ```text
/// | payload_len: u32 | op_code: u32 | rpc_id: u32 | route_id: u64 | payload |
/// ```
#[derive(Clone, Debug)]
pub struct LengthPrefixedFramer {
    max_packet_size: usize,
}

impl LengthPrefixedFramer {
    /// Creates a framer rejecting payloads longer than `max_packet_size`.
    pub fn new(max_packet_size: usize) -> Self {
        LengthPrefixedFramer { max_packet_size }
    }

    /// Returns the largest payload accepted by [`pack`](PacketFramer::pack) and
    /// [`try_unpack`](PacketFramer::try_unpack).
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl PacketFramer for LengthPrefixedFramer {
    fn pack(
        &self,
        rpc_id: u32,
        op_code: u32,
        route_id: u64,
        payload: &[u8],
        dst: &mut BytesMut,
    ) -> Result<(), FrameError> {
        let len = payload.len();
        let wire_len = match u32::try_from(len) {
            Ok(wire_len) if len <= self.max_packet_size => wire_len,
            _ => {
                return Err(FrameError::PacketTooLarge {
                    len,
                    max: self.max_packet_size,
                })
            }
        };

        dst.reserve(HEADER_LEN + len);
        dst.put_u32_le(wire_len);
        dst.put_u32_le(op_code);
        dst.put_u32_le(rpc_id);
        dst.put_u64_le(route_id);
        dst.put_slice(payload);
        Ok(())
    }

    fn try_unpack(&self, src: &mut BytesMut) -> Result<Option<Packet>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_packet_size {
            return Err(FrameError::PacketTooLarge {
                len,
                max: self.max_packet_size,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_LEN);
        header.advance(4);
        let op_code = header.get_u32_le();
        let rpc_id = header.get_u32_le();
        let route_id = header.get_u64_le();
        let payload = src.split_to(len).freeze();

        Ok(Some(Packet {
            op_code,
            rpc_id,
            route_id,
            payload,
        }))
    }
}

impl Default for LengthPrefixedFramer {
    fn default() -> Self {
        LengthPrefixedFramer::new(1024 * 1024)
    }
}

//! Split chunk framing and reassembly.
//!
//! A packet that does not fit into one link payload is cut into chunks. Each
//! chunk carries a 3-byte split header naming its priority class and its
//! position; the last chunk uses [`MessageType::SplitWriteCmdEnd`]. Chunks of
//! one priority class never interleave, so the receiver keeps at most one
//! partial packet per class.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tracing::trace;

use crate::{MessageType, WireError};

/// Split header size in bytes
pub const SPLIT_HEADER_SIZE: usize = 3;

/// A split counter is one byte wide
pub const MAX_CHUNKS_PER_MESSAGE: usize = 256;

/// Header in front of every chunk of a split packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitHeader {
    /// Priority class the packet was queued with
    pub priority: u8,
    /// 0-based chunk position
    pub counter: u8,
    /// Last chunk of the packet
    pub is_final: bool,
}

impl SplitHeader {
    /// Encode header into buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        let message_type = if self.is_final {
            MessageType::SplitWriteCmdEnd
        } else {
            MessageType::SplitWriteCmd
        };
        buf.put_u8(message_type as u8);
        buf.put_u8(self.priority);
        buf.put_u8(self.counter);
    }

    /// Split a raw chunk into header and payload
    pub fn decode(chunk: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if chunk.len() < SPLIT_HEADER_SIZE {
            return Err(WireError::Incomplete);
        }
        let is_final = match MessageType::try_from(chunk[0]) {
            Ok(MessageType::SplitWriteCmd) => false,
            Ok(MessageType::SplitWriteCmdEnd) => true,
            _ => return Err(WireError::Type(chunk[0])),
        };
        let header = Self {
            priority: chunk[1],
            counter: chunk[2],
            is_final,
        };
        Ok((header, &chunk[SPLIT_HEADER_SIZE..]))
    }
}

/// Whether a raw chunk starts with a split header
pub fn is_split_chunk(chunk: &[u8]) -> bool {
    matches!(
        chunk.first().map(|b| MessageType::try_from(*b)),
        Some(Ok(MessageType::SplitWriteCmd | MessageType::SplitWriteCmdEnd))
    )
}

struct Partial {
    next_counter: u8,
    buf: BytesMut,
}

/// Reassembler for collecting chunks into complete packets.
///
/// Any deviation from strict counter order is a protocol violation; the
/// owner is expected to drop the link rather than resynchronise.
pub struct Reassembler {
    max_packet_size: usize,
    partial: HashMap<u8, Partial>,
}

impl Reassembler {
    /// Create a reassembler refusing packets larger than `max_packet_size`
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            partial: HashMap::new(),
        }
    }

    /// Feed one raw chunk. Returns a packet once it is complete; unsplit
    /// packets are returned immediately.
    pub fn add_chunk(&mut self, chunk: &[u8]) -> Result<Option<Bytes>, WireError> {
        if chunk.is_empty() {
            return Err(WireError::Malformed);
        }
        if !is_split_chunk(chunk) {
            if chunk.len() > self.max_packet_size {
                return Err(WireError::Size(chunk.len()));
            }
            return Ok(Some(Bytes::copy_from_slice(chunk)));
        }

        let (header, payload) = SplitHeader::decode(chunk)?;
        if payload.is_empty() {
            return Err(WireError::Malformed);
        }

        let partial = match self.partial.remove(&header.priority) {
            Some(partial) if header.counter == 0 => {
                return Err(WireError::Sequence {
                    priority: header.priority,
                    expected: partial.next_counter,
                    got: 0,
                });
            }
            None if header.counter != 0 => {
                return Err(WireError::Sequence {
                    priority: header.priority,
                    expected: 0,
                    got: header.counter,
                });
            }
            Some(partial) if partial.next_counter != header.counter => {
                return Err(WireError::Sequence {
                    priority: header.priority,
                    expected: partial.next_counter,
                    got: header.counter,
                });
            }
            Some(partial) => partial,
            None => Partial {
                next_counter: 0,
                buf: BytesMut::new(),
            },
        };

        let mut partial = partial;
        if partial.buf.len() + payload.len() > self.max_packet_size {
            return Err(WireError::Size(partial.buf.len() + payload.len()));
        }
        partial.buf.extend_from_slice(payload);

        if header.is_final {
            trace!(
                "Reassembled {} bytes on priority {} from {} chunks",
                partial.buf.len(),
                header.priority,
                header.counter as usize + 1
            );
            return Ok(Some(partial.buf.freeze()));
        }

        partial.next_counter = header
            .counter
            .checked_add(1)
            .ok_or(WireError::Size(MAX_CHUNKS_PER_MESSAGE + 1))?;
        self.partial.insert(header.priority, partial);
        Ok(None)
    }

    /// Whether a packet is partially received on any priority
    pub fn is_receiving(&self) -> bool {
        !self.partial.is_empty()
    }

    /// Drop every partial packet
    pub fn reset(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(priority: u8, counter: u8, is_final: bool, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        SplitHeader {
            priority,
            counter,
            is_final,
        }
        .encode(&mut buf);
        buf.extend_from_slice(payload);
        buf.freeze()
    }

    #[test]
    fn test_reassemble_in_order() {
        let mut reassembler = Reassembler::new(1024);
        assert_eq!(reassembler.add_chunk(&chunk(1, 0, false, b"hel")).unwrap(), None);
        assert!(reassembler.is_receiving());
        assert_eq!(reassembler.add_chunk(&chunk(1, 1, false, b"lo ")).unwrap(), None);
        let packet = reassembler.add_chunk(&chunk(1, 2, true, b"mesh")).unwrap();
        assert_eq!(packet.as_deref(), Some(&b"hello mesh"[..]));
        assert!(!reassembler.is_receiving());
    }

    #[test]
    fn test_unsplit_packet_passes_through() {
        let mut reassembler = Reassembler::new(1024);
        let raw = [MessageType::Data1 as u8, 1, 0, 2, 0, 9];
        assert_eq!(reassembler.add_chunk(&raw).unwrap().as_deref(), Some(&raw[..]));
    }

    #[test]
    fn test_priorities_reassemble_independently() {
        let mut reassembler = Reassembler::new(1024);
        reassembler.add_chunk(&chunk(2, 0, false, b"low-")).unwrap();
        reassembler.add_chunk(&chunk(0, 0, false, b"vital-")).unwrap();
        let vital = reassembler.add_chunk(&chunk(0, 1, true, b"done")).unwrap();
        assert_eq!(vital.as_deref(), Some(&b"vital-done"[..]));
        let low = reassembler.add_chunk(&chunk(2, 1, true, b"done")).unwrap();
        assert_eq!(low.as_deref(), Some(&b"low-done"[..]));
    }

    #[test]
    fn test_out_of_order_is_violation() {
        let mut reassembler = Reassembler::new(1024);
        reassembler.add_chunk(&chunk(1, 0, false, b"a")).unwrap();
        assert_eq!(
            reassembler.add_chunk(&chunk(1, 2, true, b"c")),
            Err(WireError::Sequence {
                priority: 1,
                expected: 1,
                got: 2
            })
        );

        let mut reassembler = Reassembler::new(1024);
        assert!(matches!(
            reassembler.add_chunk(&chunk(1, 1, true, b"b")),
            Err(WireError::Sequence { .. })
        ));

        let mut reassembler = Reassembler::new(1024);
        reassembler.add_chunk(&chunk(1, 0, false, b"a")).unwrap();
        assert!(matches!(
            reassembler.add_chunk(&chunk(1, 0, false, b"a")),
            Err(WireError::Sequence { got: 0, .. })
        ));
    }

    #[test]
    fn test_size_limit() {
        let mut reassembler = Reassembler::new(4);
        reassembler.add_chunk(&chunk(0, 0, false, b"abc")).unwrap();
        assert_eq!(
            reassembler.add_chunk(&chunk(0, 1, true, b"de")),
            Err(WireError::Size(5))
        );
    }

    #[test]
    fn test_empty_chunk_payload_rejected() {
        let mut reassembler = Reassembler::new(16);
        assert_eq!(
            reassembler.add_chunk(&chunk(0, 0, true, b"")),
            Err(WireError::Malformed)
        );
        assert_eq!(reassembler.add_chunk(&[]), Err(WireError::Malformed));
    }
}

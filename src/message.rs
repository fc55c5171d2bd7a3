//! # Peer Wire Messages
//!
//! Message types and payload codecs for the BitTorrent peer wire protocol.
//!
//! Every message is framed as:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length prefix**: 4 bytes, big-endian, covering ID plus payload
//! - **Message ID**: 1 byte
//! - **Payload**: `length - 1` bytes
//!
//! A zero length prefix is a keep-alive: no ID, no payload.
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | piece availability bitmap |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |
//!
//! Ids outside this table may appear on the wire; readers skip them.

use byteorder::{BigEndian, ByteOrder};

pub type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;

/// A decoded peer wire message. Keep-alives never reach this type; the
/// framer reports them as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    pub fn with_payload(id: MessageId, payload: Vec<u8>) -> Self {
        Message { id, payload }
    }

    /// Serialize into a wire frame: `[4 BE length][id][payload]`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut length = [0u8; 4];
        BigEndian::write_u32(&mut length, 1 + self.payload.len() as u32);

        let mut frame = Vec::with_capacity(5 + self.payload.len());
        frame.extend_from_slice(&length);
        frame.push(self.id);
        frame.extend_from_slice(&self.payload);
        frame
    }
}

/// Build a Request payload: `[4 BE index][4 BE begin][4 BE length]`.
pub fn request_payload(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 12];
    BigEndian::write_u32(&mut payload[0..4], index);
    BigEndian::write_u32(&mut payload[4..8], begin);
    BigEndian::write_u32(&mut payload[8..12], length);
    payload
}

/// A block carried by a Piece message.
#[derive(Debug, PartialEq, Eq)]
pub struct PieceBlock<'a> {
    pub index: u32,
    pub begin: u32,
    pub block: &'a [u8],
}

/// Split a Piece payload (`[4 BE index][4 BE begin][block]`) into its
/// parts. None when the payload cannot hold the two header fields.
pub fn parse_piece(payload: &[u8]) -> Option<PieceBlock<'_>> {
    if payload.len() < 8 {
        return None;
    }
    Some(PieceBlock {
        index: BigEndian::read_u32(&payload[0..4]),
        begin: BigEndian::read_u32(&payload[4..8]),
        block: &payload[8..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_frame_with_payload() {
        let message = Message::with_payload(MESSAGE_HAVE, vec![0, 0, 0, 7]);
        assert_eq!(message.serialize(), [0, 0, 0, 5, 4, 0, 0, 0, 7]);
    }

    #[test]
    fn serializes_empty_payload_frame() {
        assert_eq!(
            Message::new(MESSAGE_INTERESTED).serialize(),
            [0, 0, 0, 1, 2]
        );
    }

    #[test]
    fn request_payload_layout() {
        assert_eq!(
            request_payload(1, 16384, 16384),
            [0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn parses_piece_payload() {
        let mut payload = request_payload(3, 8, 0); // reuse the header layout
        payload.truncate(8);
        payload.extend_from_slice(b"blockdata");

        let block = parse_piece(&payload).unwrap();
        assert_eq!(block.index, 3);
        assert_eq!(block.begin, 8);
        assert_eq!(block.block, b"blockdata");
    }

    #[test]
    fn short_piece_payload_is_rejected() {
        assert!(parse_piece(&[0, 0, 0, 1, 0, 0, 0]).is_none());
    }
}

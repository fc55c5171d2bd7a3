//! # Peer Connection
//!
//! A framed view over a handshaked TCP connection to one peer.
//!
//! `PeerConn` owns the stream for its whole life; after setup, exactly one
//! worker drives it. It frames messages per the peer wire protocol, keeps
//! the peer's bitfield, and exposes deadline control so callers can bound
//! every logical step.
//!
//! ## Bitfield encoding
//!
//! Each byte covers 8 pieces, most significant bit first:
//!
//! ```text
//! Byte 0: [piece 0, 1, 2, 3, 4, 5, 6, 7]
//! Byte 1: [piece 8, 9, 10, 11, 12, 13, 14, 15]
//! ```
//!
//! An index whose byte lies past the end of the bitfield reads as absent.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};

use crate::message::{Message, MessageId};

/// A handshaked connection plus the peer's advertised piece availability.
pub struct PeerConn {
    conn: TcpStream,
    /// "host:port", kept for logging
    pub addr: String,
    /// Raw bitfield bytes, MSB-first within each byte
    pub bitfield: Vec<u8>,
}

impl PeerConn {
    /// Wrap an already-handshaked stream.
    pub fn new(conn: TcpStream, addr: String) -> PeerConn {
        PeerConn {
            conn,
            addr,
            bitfield: vec![],
        }
    }

    /// Send one message: `[4 BE length][id][payload]`.
    pub fn send(&mut self, id: MessageId, payload: &[u8]) -> std::io::Result<()> {
        let frame = Message::with_payload(id, payload.to_vec()).serialize();
        self.conn.write_all(&frame)
    }

    /// Read the next message. `None` is a keep-alive (zero length prefix).
    pub fn read(&mut self) -> std::io::Result<Option<Message>> {
        let length = self.conn.read_u32::<BigEndian>()? as usize;
        if length == 0 {
            return Ok(None);
        }

        let mut frame = vec![0u8; length];
        self.conn.read_exact(&mut frame)?;

        Ok(Some(Message::with_payload(frame[0], frame[1..].to_vec())))
    }

    /// Bound both reads and writes. Callers refresh this before each
    /// logical step.
    pub fn set_deadline(&self, timeout: Duration) -> std::io::Result<()> {
        self.conn.set_read_timeout(Some(timeout))?;
        self.conn.set_write_timeout(Some(timeout))
    }

    /// Shut the connection down in both directions.
    pub fn close(&self) {
        let _ = self.conn.shutdown(Shutdown::Both);
    }

    /// Whether the peer advertises piece `index`.
    pub fn has_piece(&self, index: usize) -> bool {
        bitfield_has_piece(&self.bitfield, index)
    }
}

/// Bit test behind [`PeerConn::has_piece`]: piece 0 sits in the most
/// significant bit of byte 0.
pub fn bitfield_has_piece(bitfield: &[u8], index: usize) -> bool {
    let byte_index = index / 8;
    let offset = 7 - (index % 8);
    match bitfield.get(byte_index) {
        Some(byte) => byte >> offset & 1 == 1,
        None => false,
    }
}

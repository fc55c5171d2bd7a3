//! # BitTorrent Handshake
//!
//! The handshake is a fixed 68-byte message exchanged in both directions
//! immediately after the TCP connection is established:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, length of the protocol string (19)
//! - **pstr**: "BitTorrent protocol"
//! - **reserved**: 8 bytes, zero here, ignored on receipt
//! - **info_hash**: 20 bytes, must match on both sides
//! - **peer_id**: 20 bytes
//!
//! The infohash check is what keeps a client out of the wrong swarm; a
//! mismatch closes the connection.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

use crate::identity;

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";
const HANDSHAKE_LEN: usize = 68;

// The whole handshake (connect, send, receive) runs under this deadline.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("could not resolve peer address {0}")]
    BadAddress(String),
    #[error("invalid protocol string from peer")]
    BadProtocol,
    #[error("infohash mismatch from peer")]
    InfoHashMismatch,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Serialize the 68-byte handshake for `info_hash` and this process's
/// peer id.
fn build_handshake(info_hash: &[u8; 20]) -> [u8; HANDSHAKE_LEN] {
    let mut msg = [0u8; HANDSHAKE_LEN];
    msg[0] = PROTOCOL_ID.len() as u8;
    msg[1..20].copy_from_slice(PROTOCOL_ID);
    // bytes 20..28 are the reserved block, left zero
    msg[28..48].copy_from_slice(info_hash);
    msg[48..68].copy_from_slice(identity::peer_id());
    msg
}

/// Connect to `addr` ("host:port") and perform the handshake.
///
/// On success the stream is returned still carrying the handshake
/// timeouts; callers refresh deadlines for whatever they do next.
///
/// # Errors
///
/// Fails on connect errors, an unexpected protocol string, or an echoed
/// infohash that differs from the one sent.
pub fn handshake(addr: &str, info_hash: &[u8; 20]) -> Result<TcpStream, HandshakeError> {
    let socket_addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| HandshakeError::BadAddress(addr.to_string()))?;

    let mut conn = TcpStream::connect_timeout(&socket_addr, HANDSHAKE_TIMEOUT)?;
    conn.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    conn.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

    conn.write_all(&build_handshake(info_hash))?;

    let mut resp = [0u8; HANDSHAKE_LEN];
    conn.read_exact(&mut resp)?;

    if resp[0] as usize != PROTOCOL_ID.len() || &resp[1..20] != PROTOCOL_ID {
        return Err(HandshakeError::BadProtocol);
    }
    // reserved bytes 20..28 are ignored
    if resp[28..48] != info_hash[..] {
        return Err(HandshakeError::InfoHashMismatch);
    }

    Ok(conn)
}

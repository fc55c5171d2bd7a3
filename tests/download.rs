//! End-to-end download tests against an in-process mock seeder.
//!
//! The seeder speaks just enough of the peer wire protocol for the
//! coordinator: it answers handshakes, advertises an all-ones bitfield,
//! unchokes on Interested, and serves Request messages from an in-memory
//! payload. Both the validation connection and the download connection go
//! through the same accept loop.

use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use sha1::{Digest, Sha1};

use marmot::download::{download, DownloadError};
use marmot::torrent::Torrent;

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";
const INFO_HASH: [u8; 20] = *b"integration-infohash";

/// How far a mock peer plays along.
#[derive(Clone, Copy, PartialEq)]
enum SeederMode {
    /// Serve every request until the client disconnects
    Full,
    /// Send the bitfield, then drop the connection
    DieAfterBitfield,
}

/// Start a seeder for `payload` split into `piece_length` pieces.
/// Returns the address peers should dial.
fn start_seeder(payload: Vec<u8>, piece_length: usize, mode: SeederMode) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let payload = Arc::new(payload);

    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(conn) = conn else { return };
            let payload = Arc::clone(&payload);
            thread::spawn(move || serve_peer(conn, &payload, piece_length, mode));
        }
    });

    addr
}

fn serve_peer(mut conn: TcpStream, payload: &[u8], piece_length: usize, mode: SeederMode) {
    // Drain the client handshake, echo a valid one back.
    let mut handshake = [0u8; 68];
    if conn.read_exact(&mut handshake).is_err() {
        return;
    }
    let mut response = [0u8; 68];
    response[0] = 19;
    response[1..20].copy_from_slice(PROTOCOL_ID);
    response[28..48].copy_from_slice(&INFO_HASH);
    response[48..68].copy_from_slice(b"-MK0001-INTEGRATION-");
    if conn.write_all(&response).is_err() {
        return;
    }

    // Advertise everything. The validation connection closes here; writes
    // into it just fail.
    let num_pieces = payload.len().div_ceil(piece_length);
    let bitfield = vec![0xff; num_pieces.div_ceil(8)];
    if write_frame(&mut conn, 5, &bitfield).is_err() {
        return;
    }

    if mode == SeederMode::DieAfterBitfield {
        return;
    }

    while let Some((id, frame)) = read_frame(&mut conn) {
        match id {
            2 => {
                // Interested -> Unchoke
                if write_frame(&mut conn, 1, &[]).is_err() {
                    return;
                }
            }
            6 => {
                let index = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
                let begin = u32::from_be_bytes(frame[4..8].try_into().unwrap()) as usize;
                let length = u32::from_be_bytes(frame[8..12].try_into().unwrap()) as usize;

                let offset = index * piece_length + begin;
                let block = &payload[offset..offset + length];

                let mut piece = Vec::with_capacity(8 + block.len());
                piece.extend_from_slice(&(index as u32).to_be_bytes());
                piece.extend_from_slice(&(begin as u32).to_be_bytes());
                piece.extend_from_slice(block);
                if write_frame(&mut conn, 7, &piece).is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

fn write_frame(conn: &mut TcpStream, id: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    frame.push(id);
    frame.extend_from_slice(payload);
    conn.write_all(&frame)
}

fn read_frame(conn: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    loop {
        let mut length = [0u8; 4];
        conn.read_exact(&mut length).ok()?;
        let length = u32::from_be_bytes(length) as usize;
        if length == 0 {
            continue; // keep-alive
        }
        let mut frame = vec![0u8; length];
        conn.read_exact(&mut frame).ok()?;
        return Some((frame[0], frame[1..].to_vec()));
    }
}

fn make_torrent(payload: &[u8], piece_length: usize, peers: &[String]) -> Torrent {
    Torrent {
        name: "integration".to_string(),
        length: payload.len() as u64,
        piece_length: piece_length as u64,
        piece_hashes: payload
            .chunks(piece_length)
            .map(|piece| Sha1::digest(piece).into())
            .collect(),
        info_hash: INFO_HASH,
        private: false,
        primary_tracker: None,
        trackers: HashSet::new(),
        peers: peers.iter().cloned().collect(),
    }
}

/// Deterministic payload that differs across blocks and pieces.
fn test_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn downloads_a_single_piece_torrent() {
    let payload = test_payload(40_000); // one piece, three blocks
    let addr = start_seeder(payload.clone(), payload.len(), SeederMode::Full);
    let torrent = make_torrent(&payload, payload.len(), &[addr]);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("single.bin");

    download(&torrent, &output).unwrap();
    assert_eq!(fs::read(&output).unwrap(), payload);
}

#[test]
fn downloads_a_multi_piece_torrent() {
    // 32 KiB pieces: two full-size blocks each, short final piece.
    let payload = test_payload(70_000);
    let addr = start_seeder(payload.clone(), 32_768, SeederMode::Full);
    let torrent = make_torrent(&payload, 32_768, &[addr]);
    assert_eq!(torrent.num_pieces(), 3);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("multi.bin");

    download(&torrent, &output).unwrap();
    assert_eq!(fs::read(&output).unwrap(), payload);
}

#[test]
fn empty_peer_set_fails_before_any_io() {
    let payload = test_payload(1024);
    let torrent = make_torrent(&payload, 1024, &[]);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("never-created.bin");

    assert!(matches!(
        download(&torrent, &output),
        Err(DownloadError::NoPeers)
    ));
    assert!(!output.exists());
}

#[test]
fn losing_every_peer_reports_an_incomplete_download() {
    let payload = test_payload(2048);
    let addr = start_seeder(payload.clone(), 1024, SeederMode::DieAfterBitfield);
    let torrent = make_torrent(&payload, 1024, &[addr]);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("partial.bin");

    assert!(matches!(
        download(&torrent, &output),
        Err(DownloadError::Incomplete {
            completed: 0,
            total: 2
        })
    ));
}

#[test]
fn unreachable_peer_fails_validation() {
    let payload = test_payload(1024);
    // port 1 is essentially always closed
    let torrent = make_torrent(&payload, 1024, &["127.0.0.1:1".to_string()]);

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("unreachable.bin");

    assert!(matches!(
        download(&torrent, &output),
        Err(DownloadError::NoReachablePeers)
    ));
}

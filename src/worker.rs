//! # Download Worker
//!
//! One worker drives one peer connection for the whole download.
//!
//! The loop is deliberately simple: pop a piece, download it, emit the
//! result, repeat. Any per-piece failure (socket error, choke, protocol
//! violation, hash mismatch) returns the piece to the queue and retires the
//! peer for the rest of the run. Work flows back to the queue, other peers
//! pick it up, and the swarm converges without per-peer recovery logic.
//!
//! ## Pipelining
//!
//! Within a piece, up to 5 block requests are kept in flight at 16 KiB per
//! block. That saturates most peers without per-peer rate estimation. The
//! read deadline is refreshed to 30 seconds before every read, so a stalled
//! peer costs at most one deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, warn};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::message::{self, Message};
use crate::peer::PeerConn;
use crate::piece::{PieceResult, PieceWork, WorkQueue};

/// Block size for piece requests (16 KiB).
pub const BLOCK_SIZE: u32 = 16 * 1024;

// In-flight block requests per peer.
const MAX_BACKLOG: u32 = 5;
// Rolling deadline refreshed before every read during a piece download.
const PIECE_DEADLINE: Duration = Duration::from_secs(30);
// Sleep between polls of an empty work queue.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Why a piece download failed. Every variant retires the peer.
#[derive(Debug, Error)]
pub enum PieceError {
    #[error("peer choked us mid-download")]
    Choked,
    #[error("piece {0} hash mismatch")]
    HashMismatch(u32),
    #[error("piece index mismatch: got {got}, want {want}")]
    IndexMismatch { got: u32, want: u32 },
    #[error("block overflows piece boundary")]
    BlockOverflow,
    #[error("piece message too short")]
    ShortPieceMessage,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Download pieces from one peer until the torrent completes or the peer
/// fails.
///
/// `remaining` is the shared count of pieces not yet verified; it lets
/// workers stop polling the queue once every piece has a result. A failed
/// piece is pushed back to the queue before the worker exits.
pub fn run(
    mut conn: PeerConn,
    queue: Arc<WorkQueue>,
    results: Sender<PieceResult>,
    remaining: Arc<AtomicU64>,
) {
    loop {
        if remaining.load(Ordering::SeqCst) == 0 {
            debug!("worker done, no pieces remaining peer={}", conn.addr);
            return;
        }

        let Some(work) = queue.pop() else {
            // Another worker holds the last pieces; wait for a failure to
            // return them or for remaining to hit zero.
            thread::sleep(IDLE_POLL);
            continue;
        };

        match download_piece(&mut conn, &work) {
            Ok(data) => {
                debug!("piece verified peer={} piece={}", conn.addr, work.index);
                remaining.fetch_sub(1, Ordering::SeqCst);
                let index = work.index;
                if results.send(PieceResult { index, data }).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(
                    "piece download failed peer={} piece={} error={e}",
                    conn.addr, work.index
                );
                queue.push(work);
                return;
            }
        }
    }
}

/// Download one piece with pipelined block requests and verify its hash.
fn download_piece(conn: &mut PeerConn, work: &PieceWork) -> Result<Vec<u8>, PieceError> {
    conn.set_deadline(PIECE_DEADLINE)?;

    let mut buf = vec![0u8; work.length as usize];
    let mut downloaded: u32 = 0;
    let mut requested: u32 = 0;
    let mut backlog: u32 = 0;

    while downloaded < work.length {
        while backlog < MAX_BACKLOG && requested < work.length {
            let block_len = BLOCK_SIZE.min(work.length - requested);
            conn.send(
                message::MESSAGE_REQUEST,
                &message::request_payload(work.index, requested, block_len),
            )?;
            requested += block_len;
            backlog += 1;
        }

        conn.set_deadline(PIECE_DEADLINE)?;
        let Some(msg) = conn.read()? else {
            continue; // keep-alive
        };

        match msg.id {
            message::MESSAGE_PIECE => {
                let received = handle_block(&mut buf, &msg, work)?;
                downloaded += received;
                backlog = backlog.saturating_sub(1);
            }
            message::MESSAGE_CHOKE => return Err(PieceError::Choked),
            message::MESSAGE_HAVE => {} // irrelevant mid-piece
            _ => {}                     // unknown ids are skipped, not fatal
        }
    }

    let digest: [u8; 20] = Sha1::digest(&buf).into();
    if digest != work.hash {
        return Err(PieceError::HashMismatch(work.index));
    }

    Ok(buf)
}

/// Validate a Piece message against `work` and copy its block into place.
/// Returns the block length.
fn handle_block(buf: &mut [u8], msg: &Message, work: &PieceWork) -> Result<u32, PieceError> {
    let block = message::parse_piece(&msg.payload).ok_or(PieceError::ShortPieceMessage)?;

    if block.index != work.index {
        return Err(PieceError::IndexMismatch {
            got: block.index,
            want: work.index,
        });
    }

    let begin = block.begin as usize;
    let end = begin
        .checked_add(block.block.len())
        .filter(|&end| end <= buf.len())
        .ok_or(PieceError::BlockOverflow)?;

    buf[begin..end].copy_from_slice(block.block);
    Ok(block.block.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::message::MESSAGE_PIECE;

    fn piece_message(index: u32, begin: u32, block: &[u8]) -> Message {
        let mut payload = message::request_payload(index, begin, 0);
        payload.truncate(8);
        payload.extend_from_slice(block);
        Message::with_payload(MESSAGE_PIECE, payload)
    }

    fn work_for(data: &[u8]) -> PieceWork {
        PieceWork {
            index: 2,
            hash: Sha1::digest(data).into(),
            length: data.len() as u32,
        }
    }

    #[test]
    fn block_is_copied_at_its_offset() {
        let work = work_for(&[0u8; 8]);
        let mut buf = vec![0u8; 8];
        let msg = piece_message(2, 4, &[9, 9, 9, 9]);

        assert_eq!(handle_block(&mut buf, &msg, &work).unwrap(), 4);
        assert_eq!(buf, [0, 0, 0, 0, 9, 9, 9, 9]);
    }

    #[test]
    fn wrong_index_is_rejected() {
        let work = work_for(&[0u8; 8]);
        let mut buf = vec![0u8; 8];
        let msg = piece_message(3, 0, &[1]);

        assert!(matches!(
            handle_block(&mut buf, &msg, &work),
            Err(PieceError::IndexMismatch { got: 3, want: 2 })
        ));
    }

    #[test]
    fn overflowing_block_is_rejected() {
        let work = work_for(&[0u8; 8]);
        let mut buf = vec![0u8; 8];
        let msg = piece_message(2, 6, &[1, 2, 3, 4]);

        assert!(matches!(
            handle_block(&mut buf, &msg, &work),
            Err(PieceError::BlockOverflow)
        ));
    }

    #[test]
    fn short_payload_is_rejected() {
        let work = work_for(&[0u8; 8]);
        let mut buf = vec![0u8; 8];
        let msg = Message::with_payload(MESSAGE_PIECE, vec![0, 0, 0]);

        assert!(matches!(
            handle_block(&mut buf, &msg, &work),
            Err(PieceError::ShortPieceMessage)
        ));
    }
}

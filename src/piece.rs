//! # Piece Work Items
//!
//! Pieces are the verification units of a torrent. Each piece travels
//! through the system as a [`PieceWork`] (what to download and how to
//! verify it) and comes back as a [`PieceResult`] (verified bytes ready to
//! be written at the piece's offset).
//!
//! The [`WorkQueue`] hands pieces to workers: pops come off the front,
//! returned work goes to the tail so another peer gets a chance at it
//! before the same piece is retried.

use std::collections::VecDeque;
use std::sync::Mutex;

/// One piece to download. Immutable; owned by the queue between attempts.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 of the piece data
    pub hash: [u8; 20],
    /// Piece length in bytes
    pub length: u32,
}

/// A downloaded and hash-verified piece.
#[derive(Debug, Clone)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Verified piece data, exactly the piece length
    pub data: Vec<u8>,
}

/// Mutex-guarded FIFO of pending piece work.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<PieceWork>>,
}

impl WorkQueue {
    pub fn new(items: impl IntoIterator<Item = PieceWork>) -> WorkQueue {
        WorkQueue {
            items: Mutex::new(items.into_iter().collect()),
        }
    }

    /// Take the next piece, if any.
    pub fn pop(&self) -> Option<PieceWork> {
        self.items.lock().unwrap().pop_front()
    }

    /// Return a piece to the tail of the queue.
    pub fn push(&self, work: PieceWork) {
        self.items.lock().unwrap().push_back(work);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

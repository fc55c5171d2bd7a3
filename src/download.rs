//! # Download Coordinator
//!
//! Drives a full download from a discovered peer set to a verified file on
//! disk, in six phases:
//!
//! 1. **Validate**: handshake-and-close every discovered address, at most
//!    20 at a time, keeping the reachable ones.
//! 2. **Setup**: reconnect to each reachable peer, declare interest, and
//!    collect its bitfield within a fixed budget. Seeders that skip the
//!    bitfield but unchoke get a fabricated all-ones bitfield.
//! 3. **Queue build**: order pieces by ascending availability across the
//!    connected peers (rarest first, stable on index).
//! 4. **Output file**: create and pre-size the target file.
//! 5. **Dispatch**: one worker thread per peer, all feeding a bounded
//!    result channel.
//! 6. **Write**: the single writer drains results, writes each piece at
//!    `index * piece_length`, and tracks progress. When every worker has
//!    exited, whatever is still queued is drained and the run either
//!    completes or reports how far it got.
//!
//! Peers fail independently; the run fails only when the swarm as a whole
//! cannot finish.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use thiserror::Error;

use crate::handshake::handshake;
use crate::message::{
    MESSAGE_BITFIELD, MESSAGE_CHOKE, MESSAGE_INTERESTED, MESSAGE_UNCHOKE,
};
use crate::peer::PeerConn;
use crate::piece::{PieceResult, PieceWork, WorkQueue};
use crate::torrent::Torrent;
use crate::worker;

// Ceiling on concurrent validation handshakes.
const MAX_CONCURRENT_VALIDATIONS: usize = 20;
// Wall-clock budget for the whole bitfield exchange.
const SETUP_BUDGET: Duration = Duration::from_secs(15);
// Deadline for each individual read during setup.
const SETUP_READ_DEADLINE: Duration = Duration::from_secs(10);
// Deadline restored once a peer is ready for downloading.
const ACTIVE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no peers discovered; cannot download")]
    NoPeers,
    #[error("no reachable peers found")]
    NoReachablePeers,
    #[error("no peers provided piece availability")]
    NoBitfields,
    #[error("download incomplete: {completed}/{total} pieces received (all peers disconnected)")]
    Incomplete { completed: usize, total: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Download `torrent` into the file at `output`.
///
/// `torrent.peers` must already be populated by tracker discovery.
pub fn download(torrent: &Torrent, output: &Path) -> Result<(), DownloadError> {
    if torrent.peers.is_empty() {
        return Err(DownloadError::NoPeers);
    }

    eprintln!("Validating peers...");
    let valid_addrs = validate_peers(torrent);
    if valid_addrs.is_empty() {
        return Err(DownloadError::NoReachablePeers);
    }
    eprintln!("{} reachable peer(s) found", valid_addrs.len());

    eprintln!("Connecting and collecting piece availability...");
    let peers = collect_bitfields(valid_addrs, torrent);
    if peers.is_empty() {
        return Err(DownloadError::NoBitfields);
    }
    eprintln!("{} peer(s) ready for downloading", peers.len());

    let queue = Arc::new(build_rarest_first_queue(&peers, torrent));

    let mut file = File::create(output)?;
    file.set_len(torrent.length)?;

    run_workers(peers, queue, torrent, &mut file)
}

/// Phases 5 and 6: dispatch one worker per peer and write results as they
/// arrive.
fn run_workers(
    peers: Vec<PeerConn>,
    queue: Arc<WorkQueue>,
    torrent: &Torrent,
    file: &mut File,
) -> Result<(), DownloadError> {
    let num_pieces = torrent.num_pieces();
    let (result_tx, result_rx) = bounded::<PieceResult>(num_pieces);
    let (done_tx, done_rx) = bounded::<()>(1);

    let remaining = Arc::new(AtomicU64::new(num_pieces as u64));
    let alive_peers = Arc::new(AtomicU64::new(peers.len() as u64));

    let mut handles = Vec::with_capacity(peers.len());
    for conn in peers {
        let queue = Arc::clone(&queue);
        let results = result_tx.clone();
        let remaining = Arc::clone(&remaining);
        let alive_peers = Arc::clone(&alive_peers);

        handles.push(thread::spawn(move || {
            worker::run(conn, queue, results, remaining);
            alive_peers.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    drop(result_tx);

    // Fires once every worker has exited, successfully or not.
    thread::spawn(move || {
        for handle in handles {
            let _ = handle.join();
        }
        let _ = done_tx.send(());
    });

    let progress = progress_bar(torrent.length);
    let mut completed = 0usize;

    while completed < num_pieces {
        select! {
            recv(result_rx) -> received => match received {
                Ok(result) => {
                    write_piece(file, torrent, &result)?;
                    completed += 1;
                    progress.inc(result.data.len() as u64);
                    progress.set_message(format!(
                        "{} peer(s)",
                        alive_peers.load(Ordering::SeqCst)
                    ));
                }
                // All senders gone with the channel empty: nothing more
                // can arrive.
                Err(_) => break,
            },
            recv(done_rx) -> _ => {
                while let Ok(result) = result_rx.try_recv() {
                    write_piece(file, torrent, &result)?;
                    completed += 1;
                    progress.inc(result.data.len() as u64);
                }
                break;
            }
        }
    }

    if completed < num_pieces {
        progress.abandon();
        return Err(DownloadError::Incomplete {
            completed,
            total: num_pieces,
        });
    }

    progress.finish();
    Ok(())
}

/// Phase 1: handshake-and-close every address, keeping the ones that
/// answered correctly. At most [`MAX_CONCURRENT_VALIDATIONS`] in flight.
fn validate_peers(torrent: &Torrent) -> Vec<String> {
    let work: Arc<Mutex<Vec<String>>> =
        Arc::new(Mutex::new(torrent.peers.iter().cloned().collect()));
    let valid = Arc::new(Mutex::new(Vec::new()));
    let info_hash = torrent.info_hash;

    let num_workers = MAX_CONCURRENT_VALIDATIONS.min(torrent.peers.len());
    let mut handles = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        let work = Arc::clone(&work);
        let valid = Arc::clone(&valid);

        handles.push(thread::spawn(move || loop {
            let Some(addr) = work.lock().unwrap().pop() else {
                return;
            };
            match handshake(&addr, &info_hash) {
                Ok(conn) => {
                    drop(conn);
                    info!("peer reachable addr={addr}");
                    valid.lock().unwrap().push(addr);
                }
                Err(e) => warn!("peer unreachable addr={addr} error={e}"),
            }
        }));
    }

    for handle in handles {
        let _ = handle.join();
    }

    let mut valid = valid.lock().unwrap();
    valid.drain(..).collect()
}

/// Phase 2: reconnect to each validated address and collect its bitfield.
fn collect_bitfields(addrs: Vec<String>, torrent: &Torrent) -> Vec<PeerConn> {
    let peers = Arc::new(Mutex::new(Vec::new()));
    let info_hash = torrent.info_hash;
    let num_pieces = torrent.num_pieces();

    let mut handles = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let peers = Arc::clone(&peers);
        handles.push(thread::spawn(move || {
            if let Some(conn) = setup_peer(addr, info_hash, num_pieces) {
                peers.lock().unwrap().push(conn);
            }
        }));
    }

    for handle in handles {
        let _ = handle.join();
    }

    let mut peers = peers.lock().unwrap();
    peers.drain(..).collect()
}

/// Handshake, declare interest, and wait for the peer's bitfield.
///
/// Runs under a 15-second budget with a 10-second deadline per read. A
/// peer that unchokes without ever sending a bitfield is assumed to be a
/// seeder and gets an all-ones bitfield; a peer that chokes or stays
/// silent is dropped.
fn setup_peer(addr: String, info_hash: [u8; 20], num_pieces: usize) -> Option<PeerConn> {
    let conn = match handshake(&addr, &info_hash) {
        Ok(conn) => conn,
        Err(e) => {
            warn!("setup handshake failed addr={addr} error={e}");
            return None;
        }
    };

    let mut peer = PeerConn::new(conn, addr);
    if let Err(e) = peer
        .set_deadline(ACTIVE_DEADLINE)
        .and_then(|_| peer.send(MESSAGE_INTERESTED, &[]))
    {
        warn!("failed to send Interested addr={} error={e}", peer.addr);
        peer.close();
        return None;
    }

    let mut unchoked_without_bitfield = false;
    let budget_end = Instant::now() + SETUP_BUDGET;

    while Instant::now() < budget_end {
        if peer.set_deadline(SETUP_READ_DEADLINE).is_err() {
            peer.close();
            return None;
        }
        let msg = match peer.read() {
            Ok(Some(msg)) => msg,
            Ok(None) => continue, // keep-alive
            Err(e) => {
                warn!("read error during setup addr={} error={e}", peer.addr);
                peer.close();
                return None;
            }
        };
        match msg.id {
            MESSAGE_BITFIELD => {
                peer.bitfield = msg.payload;
                break;
            }
            MESSAGE_UNCHOKE => {
                // Some seeders skip the bitfield; keep waiting a little.
                unchoked_without_bitfield = true;
            }
            MESSAGE_CHOKE => {
                warn!("peer choked us during setup addr={}", peer.addr);
                peer.close();
                return None;
            }
            _ => {}
        }
    }

    if peer.bitfield.is_empty() && unchoked_without_bitfield {
        peer.bitfield = vec![0xff; num_pieces.div_ceil(8)];
    }
    if peer.bitfield.is_empty() {
        warn!("peer provided no bitfield addr={}", peer.addr);
        peer.close();
        return None;
    }

    let available = (0..num_pieces).filter(|&i| peer.has_piece(i)).count();
    info!(
        "peer connected addr={} pieces_available={available}/{num_pieces}",
        peer.addr
    );

    if peer.set_deadline(ACTIVE_DEADLINE).is_err() {
        peer.close();
        return None;
    }
    Some(peer)
}

/// Phase 3: queue pieces in ascending order of availability across the
/// connected peers. The sort is stable, so equally-rare pieces keep their
/// index order.
fn build_rarest_first_queue(peers: &[PeerConn], torrent: &Torrent) -> WorkQueue {
    let num_pieces = torrent.num_pieces();

    let mut availability = vec![0u32; num_pieces];
    for peer in peers {
        for (index, count) in availability.iter_mut().enumerate() {
            if peer.has_piece(index) {
                *count += 1;
            }
        }
    }

    WorkQueue::new(rarest_first_indices(&availability).into_iter().map(|index| {
        PieceWork {
            index: index as u32,
            hash: torrent.piece_hashes[index],
            length: torrent.piece_len(index) as u32,
        }
    }))
}

/// Piece indices sorted by ascending availability, ties broken by index.
fn rarest_first_indices(availability: &[u32]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..availability.len()).collect();
    indices.sort_by_key(|&index| availability[index]);
    indices
}

fn write_piece(file: &mut File, torrent: &Torrent, result: &PieceResult) -> std::io::Result<()> {
    let offset = result.index as u64 * torrent.piece_length;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&result.data)
}

fn progress_bar(total_bytes: u64) -> ProgressBar {
    let progress = ProgressBar::new(total_bytes);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    progress
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rarest_pieces_come_first() {
        let availability = [3, 1, 2, 1, 0];
        assert_eq!(rarest_first_indices(&availability), [4, 1, 3, 2, 0]);
    }

    #[test]
    fn ties_keep_index_order() {
        let availability = [1, 1, 1];
        assert_eq!(rarest_first_indices(&availability), [0, 1, 2]);
    }

    #[test]
    fn rarest_first_is_a_total_order_over_all_pieces() {
        let availability = [2, 0, 2, 1];
        let order = rarest_first_indices(&availability);
        assert_eq!(order.len(), availability.len());
        for window in order.windows(2) {
            assert!(availability[window[0]] <= availability[window[1]]);
        }
    }
}

//! # Marmot
//!
//! A command-line BitTorrent client.
//!
//! ## Features
//!
//! - Hand-rolled bencode codec with canonical (sorted-key) encoding
//! - Metainfo parsing with infohash computation
//! - Peer discovery over HTTP(S) trackers, concurrent announces
//! - Peer wire protocol over TCP with pipelined block requests
//! - Rarest-first piece scheduling across multiple peers
//! - Per-piece SHA-1 verification
//!
//! ## Architecture
//!
//! The client is thread-based:
//!
//! - **Main thread**: parses arguments, loads the torrent, discovers peers,
//!   and runs the writer loop
//! - **Worker threads**: one per connected peer, each downloading pieces
//!   from a shared queue
//! - **Channels**: completed pieces flow to the writer over a bounded
//!   crossbeam channel
//!
//! Data flow: metainfo bytes -> [`bencode`] tree -> [`torrent::Torrent`]
//! descriptor -> [`tracker`] peer set -> [`download`] coordinator ->
//! [`handshake`] + [`peer::PeerConn`] -> [`worker`] piece downloads ->
//! output file.

pub mod bencode;
pub mod download;
pub mod handshake;
pub mod identity;
pub mod message;
pub mod peer;
pub mod piece;
pub mod torrent;
pub mod tracker;
pub mod worker;

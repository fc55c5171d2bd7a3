//! # Torrent Metainfo
//!
//! Parsing of `.torrent` files into a typed descriptor.
//!
//! ## Metainfo layout
//!
//! A torrent file is one bencoded dictionary:
//!
//! - **announce**: primary tracker URL
//! - **announce-list**: optional tracker tiers (list of lists of URLs)
//! - **info**: the dictionary that identifies the torrent
//!   - **name**: suggested output filename
//!   - **piece length**: size of each piece except possibly the last
//!   - **pieces**: concatenated 20-byte SHA-1 digests, one per piece
//!   - **length**: total size (single-file), or **files** with per-file
//!     lengths (multi-file)
//!   - **private**: optional flag restricting discovery to trackers
//!
//! ## Infohash
//!
//! The infohash is the SHA-1 of the `info` dictionary re-encoded with the
//! canonical codec. Because encoding always emits keys in ascending byte
//! order, two metainfo files that differ only in key order produce the same
//! infohash.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use log::warn;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode::{self, BencodeError, Value};

/// Size of a SHA-1 digest in bytes.
pub const SHA1_HASH_SIZE: usize = 20;

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("invalid metainfo: {0}")]
    BadMetainfo(&'static str),
    #[error("could not decode metainfo: {0}")]
    Codec(#[from] BencodeError),
    #[error("could not read torrent: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed torrent descriptor.
///
/// Lives for the whole run; `peers` starts empty and is filled in by
/// tracker discovery before a download.
#[derive(Debug, Clone, Default)]
pub struct Torrent {
    /// Suggested output filename from the metainfo
    pub name: String,
    /// Total payload size in bytes
    pub length: u64,
    /// Nominal piece size in bytes (the last piece may be shorter)
    pub piece_length: u64,
    /// One SHA-1 digest per piece
    pub piece_hashes: Vec<[u8; SHA1_HASH_SIZE]>,
    /// SHA-1 of the canonically encoded info dictionary
    pub info_hash: [u8; SHA1_HASH_SIZE],
    /// Tracker-only discovery requested by the metainfo
    pub private: bool,
    /// The announce URL, when it is HTTP(S)
    pub primary_tracker: Option<String>,
    /// All HTTP(S) tracker URLs, announce and announce-list merged
    pub trackers: HashSet<String>,
    /// "host:port" peer addresses, populated by discovery
    pub peers: HashSet<String>,
}

impl Torrent {
    /// Read and parse a torrent file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Torrent, MetainfoError> {
        let data = fs::read(path)?;
        Torrent::from_bytes(&data)
    }

    /// Parse torrent metainfo from raw bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Torrent, MetainfoError> {
        let root = bencode::from_bytes(data)?;
        if root.as_dict().is_none() {
            return Err(MetainfoError::BadMetainfo("root is not a dictionary"));
        }

        let info = root
            .get(b"info")
            .ok_or(MetainfoError::BadMetainfo("missing info dictionary"))?;
        if info.as_dict().is_none() {
            return Err(MetainfoError::BadMetainfo("info is not a dictionary"));
        }

        let name = info
            .get(b"name")
            .and_then(Value::as_bytes)
            .ok_or(MetainfoError::BadMetainfo("info has no name"))?;
        let name = String::from_utf8_lossy(name).into_owned();

        let piece_length = info
            .get(b"piece length")
            .and_then(Value::as_int)
            .ok_or(MetainfoError::BadMetainfo("info has no piece length"))?;
        if piece_length <= 0 {
            return Err(MetainfoError::BadMetainfo("piece length is not positive"));
        }
        // Request messages address blocks with 32-bit offsets.
        if piece_length > u32::MAX as i64 {
            return Err(MetainfoError::BadMetainfo("piece length exceeds 32 bits"));
        }
        let piece_length = piece_length as u64;

        let piece_hashes = split_piece_hashes(
            info.get(b"pieces")
                .and_then(Value::as_bytes)
                .ok_or(MetainfoError::BadMetainfo("info has no pieces"))?,
        )?;

        let length = total_length(info)?;
        check_piece_count(length, piece_length, piece_hashes.len())?;

        let info_hash: [u8; SHA1_HASH_SIZE] = Sha1::digest(bencode::encode(info)).into();

        let mut torrent = Torrent {
            name,
            length,
            piece_length,
            piece_hashes,
            info_hash,
            private: parse_private_flag(info),
            ..Torrent::default()
        };

        if let Some(announce) = root.get(b"announce").and_then(Value::as_str) {
            if is_http_tracker(announce) {
                torrent.primary_tracker = Some(announce.to_string());
                torrent.trackers.insert(announce.to_string());
            } else {
                warn!("ignoring non-HTTP announce url={announce}");
            }
        }

        if let Some(tiers) = root.get(b"announce-list").and_then(Value::as_list) {
            for tier in tiers.iter().filter_map(Value::as_list) {
                for url in tier.iter().filter_map(Value::as_str) {
                    if is_http_tracker(url) {
                        torrent.trackers.insert(url.to_string());
                    }
                }
            }
        }

        Ok(torrent)
    }

    /// Number of pieces in the torrent.
    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length in bytes of piece `index`; only the last piece may fall short
    /// of the nominal piece length.
    pub fn piece_len(&self, index: usize) -> u64 {
        let begin = index as u64 * self.piece_length;
        let end = (begin + self.piece_length).min(self.length);
        end - begin
    }
}

fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; SHA1_HASH_SIZE]>, MetainfoError> {
    if pieces.is_empty() {
        return Err(MetainfoError::BadMetainfo("pieces is empty"));
    }
    if pieces.len() % SHA1_HASH_SIZE != 0 {
        return Err(MetainfoError::BadMetainfo(
            "pieces is not a multiple of 20 bytes",
        ));
    }

    Ok(pieces
        .chunks_exact(SHA1_HASH_SIZE)
        .map(|chunk| {
            let mut hash = [0u8; SHA1_HASH_SIZE];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// Single-file torrents carry `length`; multi-file torrents carry `files`,
/// whose per-file lengths are summed.
fn total_length(info: &Value) -> Result<u64, MetainfoError> {
    if let Some(length) = info.get(b"length").and_then(Value::as_int) {
        if length < 0 {
            return Err(MetainfoError::BadMetainfo("length is negative"));
        }
        return Ok(length as u64);
    }

    let files = info
        .get(b"files")
        .and_then(Value::as_list)
        .ok_or(MetainfoError::BadMetainfo(
            "info has neither length nor files",
        ))?;

    let mut total: u64 = 0;
    for file in files {
        let length = file
            .get(b"length")
            .and_then(Value::as_int)
            .ok_or(MetainfoError::BadMetainfo("file entry has no length"))?;
        if length < 0 {
            return Err(MetainfoError::BadMetainfo("file length is negative"));
        }
        total += length as u64;
    }
    Ok(total)
}

fn check_piece_count(
    length: u64,
    piece_length: u64,
    num_pieces: usize,
) -> Result<(), MetainfoError> {
    let full = (num_pieces as u64 - 1) * piece_length;
    // The last piece length must land in (0, piece_length].
    if length <= full || length > full + piece_length {
        return Err(MetainfoError::BadMetainfo(
            "pieces do not cover the total length",
        ));
    }
    Ok(())
}

/// The `private` flag appears in the wild both as an integer and as an
/// ASCII digit string. Anything else present is warned about and treated
/// as false.
fn parse_private_flag(info: &Value) -> bool {
    match info.get(b"private") {
        None => false,
        Some(Value::Int(0)) => false,
        Some(Value::Int(1)) => true,
        Some(value) => match value.as_bytes() {
            Some(b"0") => false,
            Some(b"1") => true,
            _ => {
                warn!("unparseable private flag in metainfo, assuming false");
                false
            }
        },
    }
}

fn is_http_tracker(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

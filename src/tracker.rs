//! # HTTP Tracker Client
//!
//! Peer discovery over HTTP(S) trackers.
//!
//! Each announce is a GET request carrying the infohash, the client
//! identity, and transfer counters as query parameters. The tracker answers
//! with a bencoded dictionary whose `peers` value is a compact list:
//! 6 bytes per peer, a big-endian IPv4 address followed by a big-endian
//! port.
//!
//! Discovery is best-effort by design. A tracker that cannot be reached,
//! answers with garbage, or omits `peers` contributes nothing; it never
//! fails the aggregate. Private torrents and single-tracker sets are
//! announced sequentially, everything else fans out with a fixed ceiling of
//! concurrent requests.

use std::collections::{HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{info, warn};
use url::Url;

use crate::bencode::{self, Value};
use crate::identity;
use crate::torrent::Torrent;

// Port reported to trackers in the announce request.
const ANNOUNCE_PORT: u16 = 6881;
// Ceiling on concurrent tracker announces.
const MAX_CONCURRENT_ANNOUNCES: usize = 10;
// Per-request HTTP timeout.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);
// Bytes per compact peer record: 4-byte IPv4 + 2-byte port.
const COMPACT_PEER_SIZE: usize = 6;

/// Announce to every tracker of `torrent` and merge the peers discovered.
///
/// Per-tracker failures are logged and swallowed; the result is empty only
/// when every tracker failed or returned nothing. The caller decides what
/// an empty set means.
pub fn discover_peers(torrent: &Torrent) -> HashSet<String> {
    let urls: Vec<String> = torrent.trackers.iter().cloned().collect();
    if urls.is_empty() {
        return HashSet::new();
    }

    if torrent.private || urls.len() == 1 {
        announce_sequential(&urls, torrent)
    } else {
        announce_concurrent(urls, torrent)
    }
}

fn announce_sequential(urls: &[String], torrent: &Torrent) -> HashSet<String> {
    let client = http_client();
    let mut peers = HashSet::new();
    for url in urls {
        announce_one(&client, url, torrent.info_hash, torrent.length, &mut peers);
    }
    peers
}

fn announce_concurrent(urls: Vec<String>, torrent: &Torrent) -> HashSet<String> {
    let work = Arc::new(Mutex::new(VecDeque::from(urls)));
    let peers = Arc::new(Mutex::new(HashSet::new()));
    let client = http_client();

    let num_workers = MAX_CONCURRENT_ANNOUNCES.min(work.lock().unwrap().len());
    let mut handles = Vec::with_capacity(num_workers);
    for _ in 0..num_workers {
        let work = Arc::clone(&work);
        let peers = Arc::clone(&peers);
        let client = client.clone();
        let info_hash = torrent.info_hash;
        let length = torrent.length;

        handles.push(thread::spawn(move || {
            let mut found = HashSet::new();
            while let Some(url) = work.lock().unwrap().pop_front() {
                announce_one(&client, &url, info_hash, length, &mut found);
            }
            peers.lock().unwrap().extend(found);
        }));
    }

    for handle in handles {
        let _ = handle.join();
    }

    let mut peers = peers.lock().unwrap();
    peers.drain().collect()
}

fn http_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .timeout(ANNOUNCE_TIMEOUT)
        .build()
        .expect("building HTTP client")
}

fn announce_one(
    client: &reqwest::blocking::Client,
    tracker: &str,
    info_hash: [u8; 20],
    length: u64,
    peers: &mut HashSet<String>,
) {
    let url = match build_announce_url(tracker, &info_hash, length) {
        Ok(url) => url,
        Err(e) => {
            warn!("invalid tracker URL tracker={tracker} error={e}");
            return;
        }
    };

    info!(
        "querying tracker tracker={tracker} infohash={}",
        hex::encode(info_hash)
    );

    let body = match client.get(&url).send().and_then(|resp| resp.bytes()) {
        Ok(body) => body,
        Err(e) => {
            warn!("tracker request failed tracker={tracker} error={e}");
            return;
        }
    };

    let before = peers.len();
    extract_peers(&body, peers);
    if peers.len() == before {
        warn!("tracker returned no peers tracker={tracker}");
    }
}

/// Build the announce URL by hand. Raw infohash and peer-id bytes must be
/// percent-encoded byte-for-byte; form encoding would mangle them.
fn build_announce_url(
    tracker: &str,
    info_hash: &[u8; 20],
    length: u64,
) -> Result<String, url::ParseError> {
    let base = Url::parse(tracker)?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        percent_encode_binary(info_hash),
        percent_encode_binary(identity::peer_id()),
        ANNOUNCE_PORT,
        length
    );

    let mut url = base.to_string();
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(&query);

    Ok(url)
}

/// Each byte becomes %XX with uppercase hex digits.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }

    encoded
}

/// Pull "host:port" strings out of a tracker response body.
///
/// The body must decode as a bencode dictionary with a byte-string `peers`
/// value. A trailing partial record is dropped, not an error.
fn extract_peers(body: &[u8], peers: &mut HashSet<String>) {
    let value = match bencode::decode(body) {
        Ok((value, _)) => value,
        Err(e) => {
            warn!("undecodable tracker response error={e}");
            return;
        }
    };

    let Some(compact) = value.get(b"peers").and_then(Value::as_bytes) else {
        return;
    };

    for record in compact.chunks_exact(COMPACT_PEER_SIZE) {
        let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
        let port = u16::from_be_bytes([record[4], record[5]]);
        peers.insert(format!("{ip}:{port}"));
    }
}

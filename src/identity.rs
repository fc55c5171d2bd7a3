//! Process-wide peer identity.
//!
//! BitTorrent identifies a client by a 20-byte peer id sent to trackers and
//! peers. The conventional Azureus-style layout is an 8-byte client prefix
//! followed by 12 random bytes, generated once per process.

use std::sync::OnceLock;

use rand::Rng;

/// Client identifier prefix, 8 bytes.
pub const PEER_ID_PREFIX: &[u8; 8] = b"-MR0001-";

static PEER_ID: OnceLock<[u8; 20]> = OnceLock::new();

/// The peer id for this process, generated on first use.
pub fn peer_id() -> &'static [u8; 20] {
    PEER_ID.get_or_init(|| {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(PEER_ID_PREFIX);
        // thread_rng is cryptographically secure
        rand::thread_rng().fill(&mut id[8..]);
        id
    })
}

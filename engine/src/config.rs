//! Engine-wide tunables (spec.md §9 configuration surface), grounded on
//! `bip_handshake::handshaker_config::HandshakerConfig` and
//! `bip_disk::disk_manager::DiskManagerBuilder`'s assortment of named
//! knobs, gathered into one struct a caller fills in (or defaults) rather
//! than the original's scattered compile-time constants.

use std::time::Duration;

/// Tunables shared by every torrent a [`crate::context::Context`] drives.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Upper bound on simultaneously open file descriptors across every
    /// torrent's storage (spec.md §4.D `FileManager::max_open`).
    pub max_open_files: usize,
    /// A dirty chunk older than this is written back on the next
    /// `sync_chunks` sweep (spec.md §4.D `sync_chunks`).
    pub sync_age_threshold: Duration,
    /// Minimum time between repeated `madvise(WILLNEED)` preloads of the
    /// same chunk (spec.md §4.D `preload`).
    pub preload_cooldown: Duration,
    /// Deadline for a handshake to reach `ReadInfo` before it's abandoned.
    pub handshake_timeout: Duration,
    /// Deadline for the post-handshake bitfield/extension exchange before
    /// the connection is dropped.
    pub bitfield_timeout: Duration,
    /// Per-direction cap on simultaneously unchoked peers within one
    /// choke-group; `None` means unlimited (spec.md §4.J `max_unchoked`).
    pub max_unchoked_upload: Option<usize>,
    pub max_unchoked_download: Option<usize>,
    /// How many outgoing handshake attempts may hold a reserved peer-info
    /// slot at once (spec.md §4.K `connect_keep_handshakes`).
    pub connect_keep_handshakes: usize,
    /// Global cap on simultaneously admitted incoming sockets, across every
    /// torrent (spec.md §4.K `can_accept_incoming`).
    pub max_incoming_connections: usize,
    /// Per-connection cap on the remote's outstanding upload-request queue
    /// (spec.md §5 "a small cardinality cap").
    pub max_incoming_requests_per_peer: usize,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            max_open_files: 100,
            sync_age_threshold: Duration::from_secs(60),
            preload_cooldown: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(60),
            bitfield_timeout: Duration::from_secs(120),
            max_unchoked_upload: Some(4),
            max_unchoked_download: Some(4),
            connect_keep_handshakes: 50,
            max_incoming_connections: 500,
            max_incoming_requests_per_peer: 100,
        }
    }
}

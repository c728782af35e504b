//! Top-level torrent/connection wiring (spec.md §2 component K's
//! connection-list half, plus the redesign notes' "top-level context"): the
//! crate a hosting binary (tracker client, CLI, DHT — all out of scope per
//! spec.md §1) links against to drive the peer-protocol core.
//!
//! Grounded on `bip_handshake::handshaker`/`bip_disk::disk::manager` for the
//! overall shape of "one struct per concern, assembled by a top-level
//! builder/context", generalized to also own the `mio` poll-loop
//! registrations those crates left to `tokio` (spec.md §4.G decided on a
//! hand-driven poll loop over async/await — see `tcore_runtime::thread`'s
//! doc comment).

#[macro_use]
extern crate error_chain;

pub mod block_source;
pub mod choke;
pub mod chunk_io;
pub mod cipher;
pub mod config;
pub mod context;
pub mod error;
pub mod leadership;
pub mod policy;
pub mod torrent;

pub use config::EngineConfig;
pub use context::{AddTorrentRequest, Command, Context, ContextHandle, NullRequestSource};
pub use error::{EngineError, EngineErrorKind, EngineResult};
pub use policy::{TorrentAdmissionPolicy, TorrentTable};
pub use torrent::Torrent;

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use tcore_disk::storage::Storage;
    use tcore_handshake::Extensions;
    use tcore_runtime::thread::Thread;
    use tcore_util::sha::ShaHash;

    use super::*;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn make_storage(dir: &std::path::Path, num_pieces: u32, chunk_size: u64) -> Storage {
        let mut storage = Storage::new(chunk_size, num_pieces);
        storage.push_back(dir.join("data"), chunk_size * num_pieces as u64).unwrap();
        storage.open().unwrap();
        storage
    }

    /// End-to-end: a `Context` listening on loopback accepts a plaintext
    /// handshake from a second `Context` dialing out, and both land the
    /// connection in their respective torrent's connection list (spec.md
    /// §8 scenario "two local peers ... attempt plaintext BitTorrent
    /// handshake on loopback").
    #[test]
    fn positive_two_contexts_complete_a_loopback_handshake() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let info_hash = ShaHash::from_bytes(b"shared info-hash!!!!");

        let thread_a = Thread::new("ctx-a", false).unwrap();
        let registry_a = thread_a.registry().try_clone().unwrap();
        let handle_a = thread_a.handle();

        let thread_b = Thread::new("ctx-b", false).unwrap();
        let registry_b = thread_b.registry().try_clone().unwrap();
        let handle_b = thread_b.handle();

        let (context_a, ctl_a) = Context::new(registry_a, EngineConfig::default(), ShaHash::from_bytes(b"peer a identifier!!!"), Extensions::new(), Some(loopback(0)), handle_a).unwrap();
        let actual_listen_addr = context_a.listen_addr().expect("context_a was given a listen address");

        let (context_b, ctl_b) = Context::new(registry_b, EngineConfig::default(), ShaHash::from_bytes(b"peer b identifier!!!"), Extensions::new(), None, handle_b).unwrap();

        ctl_a.add_torrent(AddTorrentRequest {
            info_hash,
            storage: make_storage(dir_a.path(), 2, 16),
            expected_hashes: vec![ShaHash::default(); 2],
            max_unchoked_upload: None,
            max_unchoked_download: None,
        });
        ctl_b.add_torrent(AddTorrentRequest {
            info_hash,
            storage: make_storage(dir_b.path(), 2, 16),
            expected_hashes: vec![ShaHash::default(); 2],
            max_unchoked_upload: None,
            max_unchoked_download: None,
        });

        let worker_a = std::thread::spawn(move || thread_a.run(context_a));
        let worker_b = std::thread::spawn(move || thread_b.run(context_b));

        std::thread::sleep(Duration::from_millis(50));
        ctl_b.connect_to_peer(actual_listen_addr, info_hash, false, false);
        std::thread::sleep(Duration::from_millis(200));

        ctl_a.request_shutdown();
        ctl_b.request_shutdown();
        worker_a.join().unwrap().unwrap();
        worker_b.join().unwrap().unwrap();
    }
}

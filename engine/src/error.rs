//! Top-level error taxonomy, chaining each component crate's own
//! `error_chain!` type in rather than re-describing their kinds (spec.md §9
//! "replace ... global singletons with a top-level context" implies the
//! context is also where their errors converge).

use std::net::SocketAddr;

use tcore_util::sha::InfoHash;

error_chain! {
    types {
        EngineError, EngineErrorKind, EngineResultExt, EngineResult;
    }

    links {
        Storage(tcore_disk::error::StorageError, tcore_disk::error::StorageErrorKind);
        Handshake(tcore_handshake::HandshakeError, tcore_handshake::HandshakeErrorKind);
        Peer(tcore_peer::PeerError, tcore_peer::PeerErrorKind);
        Select(tcore_select::SelectError, tcore_select::SelectErrorKind);
    }

    foreign_links {
        Io(std::io::Error);
    }

    errors {
        UnknownTorrent {
            info_hash: InfoHash
        } {
            description("no torrent registered for this info-hash")
            display("no torrent registered for info-hash {:?}", info_hash)
        }
        TorrentAlreadyAdded {
            info_hash: InfoHash
        } {
            description("a torrent with this info-hash is already registered")
            display("torrent {:?} is already registered", info_hash)
        }
        UnknownConnection {
            addr: SocketAddr
        } {
            description("no connection registered for this address")
            display("no connection registered for {}", addr)
        }
    }
}

//! The top-level context object spec.md §9's redesign notes ask for
//! ("replace ... global singletons for the manager, schedulers, and
//! instrumentation with a top-level context passed by reference"): owns the
//! main-thread poll loop's socket registrations, the handshake manager, and
//! the per-torrent table, and is the `tcore_runtime::ThreadBody` that drives
//! socket readiness into every other crate.
//!
//! Grounded on `bip_handshake::bittorrent::client::BTHandshaker` for the
//! shape of "one struct owns the listener and the handshake state machine,
//! callers reach it through a cloneable non-blocking sender" — here the
//! sender is a `crossbeam_channel::Sender<Command>` rather than `bip_util`'s
//! `TrySender`, since the context already depends on `crossbeam-channel` for
//! hash-check results and a second channel abstraction would buy nothing.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use tcore_disk::storage::Storage;
use tcore_disk::{spawn_hash_check_queue, Manager as DiskManager};
use tcore_handshake::{Disposition, Extensions, HandshakeManager, Outcome, Role};
use tcore_runtime::thread::{ThreadBody, ThreadHandle, WAKER_TOKEN};
use tcore_runtime::TimerQueue;
use tcore_util::bitfield::Bitfield;
use tcore_util::sha::{InfoHash, PeerId, ShaHash};

use crate::config::EngineConfig;
use crate::policy::{TorrentAdmissionPolicy, TorrentTable};
use crate::torrent::Torrent;

/// Read buffer size for one socket's worth of bytes per readiness event;
/// matches `tcore_peer::ProtocolBuffer`'s ~512-byte framing unit scaled up
/// for bulk piece transfer (spec.md §3 "Protocol buffer").
const READ_CHUNK: usize = 64 * 1024;

/// Request to add a torrent to a running `Context`. Metainfo parsing is out
/// of scope (spec.md §1); the caller hands over an already-`open()`ed
/// `Storage` built from whatever `.torrent` parser it uses.
pub struct AddTorrentRequest {
    pub info_hash: InfoHash,
    pub storage: Storage,
    pub expected_hashes: Vec<ShaHash>,
    pub max_unchoked_upload: Option<usize>,
    pub max_unchoked_download: Option<usize>,
}

/// Cross-thread requests a `ContextHandle` can post into the owning
/// thread's `do_work` (spec.md §4.G "do-work callback").
pub enum Command {
    AddTorrent(Box<AddTorrentRequest>),
    RemoveTorrent(InfoHash),
    ConnectToPeer { addr: SocketAddr, info_hash: InfoHash, encrypt: bool, require_rc4: bool },
}

/// Cloneable handle any thread can use to drive a `Context` running on its
/// own poll-loop thread, mirroring `ThreadHandle`'s cross-thread wake-up
/// role but for application-level commands rather than raw signal bits.
#[derive(Clone)]
pub struct ContextHandle {
    commands: Sender<Command>,
    wake: ThreadHandle,
}

impl ContextHandle {
    pub fn add_torrent(&self, request: AddTorrentRequest) {
        let _ = self.commands.send(Command::AddTorrent(Box::new(request)));
        self.wake.interrupt();
    }

    pub fn remove_torrent(&self, info_hash: InfoHash) {
        let _ = self.commands.send(Command::RemoveTorrent(info_hash));
        self.wake.interrupt();
    }

    pub fn connect_to_peer(&self, addr: SocketAddr, info_hash: InfoHash, encrypt: bool, require_rc4: bool) {
        let _ = self.commands.send(Command::ConnectToPeer { addr, info_hash, encrypt, require_rc4 });
        self.wake.interrupt();
    }

    pub fn request_shutdown(&self) {
        self.wake.request_shutdown();
    }
}

/// What a socket in `Context::sockets` represents; carries enough of the
/// original connect/accept intent to retry a failed handshake (spec.md
/// §4.I "Retry policy").
#[derive(Clone, Copy)]
enum SocketRole {
    Handshake { role: Role, info_hash: Option<InfoHash>, encrypt: bool, require_rc4: bool },
    Established { info_hash: InfoHash },
}

struct Socket {
    stream: TcpStream,
    addr: SocketAddr,
    role: SocketRole,
    out_buf: Vec<u8>,
    writable_registered: bool,
}

/// A `tcore_peer::RequestSource` that never proposes a block. Block/piece
/// selection strategy (rarest-first or otherwise) is an external
/// collaborator spec.md never specifies — §4.H only names the `RequestSource`
/// seam the pipeline replenishes through, not what picks pieces. Plugging
/// this in gives a context that accepts connections and serves uploads
/// without yet deciding what to download; a real piece-picker replaces it.
pub struct NullRequestSource;

impl tcore_peer::RequestSource for NullRequestSource {
    fn next_request(&mut self, _have: &Bitfield) -> Option<tcore_peer::BlockRequest> {
        None
    }
}

/// Top-level wiring: owns the listening socket, every in-flight
/// handshake, and the per-torrent table, and drains both socket readiness
/// and cross-thread `Command`s once per poll-loop iteration.
pub struct Context {
    config: EngineConfig,
    registry: mio::Registry,
    torrents: TorrentTable,
    handshakes: HandshakeManager<TorrentAdmissionPolicy>,
    listener: Option<TcpListener>,
    listener_token: Option<Token>,
    sockets: HashMap<Token, Socket>,
    addr_to_token: HashMap<SocketAddr, Token>,
    next_token: usize,
    commands: Receiver<Command>,
    local_peer_id: PeerId,
    local_extensions: Extensions,
}

impl Context {
    /// Build a `Context` and the handle used to drive it, registering
    /// `listen_addr` (if given) for incoming connections on `registry`.
    /// `registry` should come from a not-yet-`run()` `tcore_runtime::Thread`
    /// (`Thread::registry().try_clone()`), since `Thread::run` consumes its
    /// body and a later caller otherwise has no way to reach the poller.
    pub fn new(
        registry: mio::Registry,
        config: EngineConfig,
        local_peer_id: PeerId,
        local_extensions: Extensions,
        listen_addr: Option<SocketAddr>,
        wake: ThreadHandle,
    ) -> io::Result<(Context, ContextHandle)> {
        let torrents: TorrentTable = Arc::new(Mutex::new(HashMap::new()));
        let policy = TorrentAdmissionPolicy::new(torrents.clone(), config.max_incoming_connections);
        let handshakes = HandshakeManager::new(policy, local_peer_id, config.connect_keep_handshakes);

        let mut next_token = 0usize;
        let (listener, listener_token) = match listen_addr {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr)?;
                let token = Token(next_token);
                next_token += 1;
                registry.register(&mut listener, token, Interest::READABLE)?;
                (Some(listener), Some(token))
            }
            None => (None, None),
        };

        let (command_tx, command_rx) = crossbeam_channel::unbounded();

        let context = Context {
            config,
            registry,
            torrents,
            handshakes,
            listener,
            listener_token,
            sockets: HashMap::new(),
            addr_to_token: HashMap::new(),
            next_token,
            commands: command_rx,
            local_peer_id,
            local_extensions,
        };
        let handle = ContextHandle { commands: command_tx, wake };
        Ok((context, handle))
    }

    pub fn torrents(&self) -> &TorrentTable {
        &self.torrents
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// The address actually bound, useful when `listen_addr` was given port
    /// 0 and the OS picked one.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|listener| listener.local_addr().ok())
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn register_socket(&mut self, mut stream: TcpStream, addr: SocketAddr, role: SocketRole, out_buf: Vec<u8>) -> io::Result<()> {
        let token = self.alloc_token();
        let writable_registered = !out_buf.is_empty();
        let interest = if writable_registered { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        self.registry.register(&mut stream, token, interest)?;
        self.sockets.insert(token, Socket { stream, addr, role, out_buf, writable_registered });
        self.addr_to_token.insert(addr, token);
        Ok(())
    }

    fn close_socket(&mut self, token: Token) {
        if let Some(mut socket) = self.sockets.remove(&token) {
            let _ = self.registry.deregister(&mut socket.stream);
            self.addr_to_token.remove(&socket.addr);
            self.handshakes.abandon(&socket.addr);
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::AddTorrent(request) => self.add_torrent(*request),
                Command::RemoveTorrent(info_hash) => self.remove_torrent(info_hash),
                Command::ConnectToPeer { addr, info_hash, encrypt, require_rc4 } => {
                    if let Err(err) = self.connect_to_peer(addr, info_hash, encrypt, require_rc4) {
                        log::warn!("tcore_engine: outgoing connect to {} failed: {}", addr, err);
                    }
                }
            }
        }
    }

    fn add_torrent(&mut self, request: AddTorrentRequest) {
        let (hash_queue, hash_results) = spawn_hash_check_queue();
        let manager = DiskManager::new(request.storage, hash_queue);
        let torrent = Torrent::new(
            request.info_hash,
            manager,
            request.expected_hashes,
            hash_results,
            request.max_unchoked_upload.or(self.config.max_unchoked_upload),
            request.max_unchoked_download.or(self.config.max_unchoked_download),
            self.config.max_incoming_requests_per_peer,
        );
        self.torrents.lock().unwrap().insert(request.info_hash, torrent);
    }

    fn remove_torrent(&mut self, info_hash: InfoHash) {
        self.torrents.lock().unwrap().remove(&info_hash);
        let dead: Vec<Token> = self
            .sockets
            .iter()
            .filter(|(_, s)| matches!(s.role, SocketRole::Established { info_hash: ih } if ih == info_hash))
            .map(|(t, _)| *t)
            .collect();
        for token in dead {
            self.close_socket(token);
        }
    }

    /// Open an outgoing TCP connection and admit it as an outgoing
    /// handshake attempt (spec.md §4.K "Outgoing: reserve a peer-info slot,
    /// open+bind+connect, push a handshake in outgoing mode").
    pub fn connect_to_peer(&mut self, addr: SocketAddr, info_hash: InfoHash, encrypt: bool, require_rc4: bool) -> io::Result<()> {
        let initial = self
            .handshakes
            .admit_outgoing(addr, info_hash, self.local_extensions, encrypt, require_rc4)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

        let stream = TcpStream::connect(addr)?;
        let role = SocketRole::Handshake { role: Role::Outgoing, info_hash: Some(info_hash), encrypt, require_rc4 };
        self.register_socket(stream, addr, role, initial)
    }

    fn accept_loop(&mut self) {
        loop {
            let (stream, addr) = match self.listener.as_ref().unwrap().accept() {
                Ok(pair) => pair,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("tcore_engine: accept failed: {}", err);
                    break;
                }
            };

            if self.addr_to_token.contains_key(&addr) {
                continue;
            }

            let initial = match self.handshakes.admit_incoming(addr, self.local_extensions) {
                Ok(bytes) => bytes,
                Err(err) => {
                    log::debug!("tcore_engine: rejected incoming connection from {}: {}", addr, err);
                    continue;
                }
            };

            let role = SocketRole::Handshake { role: Role::Incoming, info_hash: None, encrypt: false, require_rc4: false };
            if let Err(err) = self.register_socket(stream, addr, role, initial) {
                log::warn!("tcore_engine: failed to register incoming socket from {}: {}", addr, err);
            }
        }
    }

    fn on_readable(&mut self, token: Token) {
        let mut buf = [0u8; READ_CHUNK];
        let (addr, role, n) = {
            let socket = match self.sockets.get_mut(&token) {
                Some(socket) => socket,
                None => return,
            };
            match socket.stream.read(&mut buf) {
                Ok(0) => (socket.addr, None, 0),
                Ok(n) => (socket.addr, Some(socket.role), n),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return,
                Err(_) => (socket.addr, None, 0),
            }
        };

        let role = match role {
            Some(role) => role,
            None => {
                self.close_socket(token);
                return;
            }
        };

        match role {
            SocketRole::Handshake { role, info_hash, encrypt, require_rc4 } => {
                self.on_handshake_bytes(token, addr, role, info_hash, encrypt, require_rc4, &buf[..n])
            }
            SocketRole::Established { info_hash } => self.dispatch_established(token, addr, info_hash, &buf[..n]),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_handshake_bytes(
        &mut self,
        token: Token,
        addr: SocketAddr,
        role: Role,
        info_hash: Option<InfoHash>,
        encrypt: bool,
        require_rc4: bool,
        data: &[u8],
    ) {
        match self.handshakes.feed(addr, data) {
            None => {}
            Some(Disposition::Accepted(outcome)) => self.on_handshake_accepted(token, addr, role, outcome),
            Some(Disposition::Rejected(addr)) => {
                log::debug!("tcore_engine: rejecting established duplicate/uninteresting peer {}", addr);
                self.close_socket(token);
            }
            Some(Disposition::Retrying(addr)) => self.retry_opposite_encryption(token, addr, role, info_hash, encrypt, require_rc4),
            Some(Disposition::Dropped(addr, err)) => {
                log::debug!("tcore_engine: handshake with {} dropped: {}", addr, err);
                self.close_socket(token);
            }
        }
    }

    /// Re-attempt a failed handshake in the opposite encryption mode
    /// (spec.md §4.I "Retry policy"). Only possible for the outgoing side:
    /// the manager has already discarded the failed `HandshakeMachine`
    /// (and whatever bytes it had buffered) by the time `Disposition::Retrying`
    /// reaches here, so an incoming attempt has nothing left to replay —
    /// spec.md §9's open questions leave the source's own retry-buffering
    /// story underspecified in the same way, and this implementation
    /// doesn't invent one.
    fn retry_opposite_encryption(&mut self, token: Token, addr: SocketAddr, role: Role, info_hash: Option<InfoHash>, encrypt: bool, _require_rc4: bool) {
        self.close_socket(token);

        if role == Role::Outgoing {
            if let Some(info_hash) = info_hash {
                log::debug!("tcore_engine: retrying outgoing handshake with {} under opposite encryption", addr);
                if let Err(err) = self.connect_to_peer(addr, info_hash, !encrypt, false) {
                    log::warn!("tcore_engine: retry connect to {} failed: {}", addr, err);
                }
                return;
            }
        }

        log::debug!("tcore_engine: dropping incoming handshake with {} (no buffered bytes to retry)", addr);
    }

    fn on_handshake_accepted(&mut self, token: Token, addr: SocketAddr, role: Role, outcome: Outcome) {
        let info_hash = outcome.info_hash;
        let residual = outcome.residual.clone();

        let accepted = {
            let mut torrents = self.torrents.lock().unwrap();
            match torrents.get_mut(&info_hash) {
                Some(torrent) => {
                    torrent.add_connection(addr, &outcome, role);
                    true
                }
                None => false,
            }
        };

        if !accepted {
            log::debug!("tcore_engine: no torrent registered for {:?}, dropping {}", info_hash, addr);
            self.close_socket(token);
            return;
        }

        if let Some(socket) = self.sockets.get_mut(&token) {
            socket.role = SocketRole::Established { info_hash };
        }

        if !residual.is_empty() {
            self.dispatch_established(token, addr, info_hash, &residual);
        }
    }

    fn dispatch_established(&mut self, token: Token, addr: SocketAddr, info_hash: InfoHash, data: &[u8]) {
        let result = {
            let mut torrents = self.torrents.lock().unwrap();
            match torrents.get_mut(&info_hash) {
                Some(torrent) => torrent.feed(addr, data),
                None => return,
            }
        };

        if let Err(err) = result {
            log::debug!("tcore_engine: connection {} violated protocol: {}", addr, err);
            self.close_socket(token);
        }
    }

    fn on_writable(&mut self, token: Token) {
        let socket = match self.sockets.get_mut(&token) {
            Some(socket) => socket,
            None => return,
        };

        loop {
            if socket.out_buf.is_empty() {
                break;
            }
            match socket.stream.write(&socket.out_buf) {
                Ok(0) => break,
                Ok(n) => {
                    socket.out_buf.drain(..n);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.close_socket(token);
                    return;
                }
            }
        }

        let socket = match self.sockets.get_mut(&token) {
            Some(socket) => socket,
            None => return,
        };
        let want_writable = !socket.out_buf.is_empty();
        if want_writable != socket.writable_registered {
            socket.writable_registered = want_writable;
            let interest = if want_writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
            let _ = self.registry.reregister(&mut socket.stream, token, interest);
        }
    }

    /// Pull every torrent's queued outgoing bytes (choke/unchoke, have,
    /// requests, piece payloads) into each connection's socket write
    /// buffer, re-arming for writability as needed. Called once per
    /// `do_work` tick (spec.md §4.H write state machine, §5 "bytes written
    /// ... become visible to peers in FIFO order").
    fn flush_torrent_writes(&mut self) {
        let mut outgoing = Vec::new();
        let mut deferred_closes = Vec::new();

        {
            let mut torrents = self.torrents.lock().unwrap();
            for torrent in torrents.values_mut() {
                torrent.poll_hash_results();
                torrent.run_choke_cycle(
                    self.config.max_unchoked_upload.unwrap_or(usize::MAX),
                    self.config.max_unchoked_download.unwrap_or(usize::MAX),
                );

                let mut source = NullRequestSource;
                outgoing.extend(torrent.poll_writes(0, &mut source));
                deferred_closes.extend(torrent.flush_deferred_erasures());
            }
        }

        for (addr, bytes) in outgoing {
            if let Some(token) = self.addr_to_token.get(&addr).copied() {
                if let Some(socket) = self.sockets.get_mut(&token) {
                    socket.out_buf.extend_from_slice(&bytes);
                }
                self.on_writable(token);
            }
        }

        for addr in deferred_closes {
            if let Some(token) = self.addr_to_token.get(&addr).copied() {
                self.close_socket(token);
            }
        }
    }
}

impl ThreadBody for Context {
    fn name(&self) -> &str {
        "tcore-engine"
    }

    fn do_work(&mut self) {
        self.drain_commands();
        self.flush_torrent_writes();
    }

    fn call_events(&mut self, _poll: &Poll, events: &Events, _timers: &mut TimerQueue) {
        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            if Some(token) == self.listener_token {
                self.accept_loop();
                continue;
            }
            if event.is_readable() {
                self.on_readable(token);
            }
            if self.sockets.contains_key(&token) && event.is_writable() {
                self.on_writable(token);
            }
        }
    }

    fn next_timeout(&mut self) -> Option<Duration> {
        Some(Duration::from_millis(250))
    }
}

//! Bridges `tcore_select::ChokeSlot` to a live `tcore_peer::PeerConnection`
//! (spec.md §4.J "Apply choke/unchoke by invoking the slot provided by each
//! peer"). `tcore_select` deliberately has no dependency on `tcore_peer` (see
//! `tcore_select::group`'s doc comment), so this thin adapter is the only
//! place the two crates meet.
//!
//! The upload-direction queue maps directly onto the wire protocol's single
//! `choke`/`unchoke` message. The download-direction queue has no such wire
//! counterpart — nothing stops a remote peer from sending us blocks — so it
//! instead gates whether this connection's request pipeline is allowed to
//! replenish on the next tick, the resource-manager's analogous knob for
//! which peers we spend our own bandwidth requesting from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tcore_peer::PeerConnection;
use tcore_select::ChokeSlot;

pub type SharedConnection = Arc<Mutex<PeerConnection>>;

/// Upload-direction membership: flips the connection's `local_choking` flag.
pub struct UploadChokeSlot(SharedConnection);

impl UploadChokeSlot {
    pub fn new(connection: SharedConnection) -> UploadChokeSlot {
        UploadChokeSlot(connection)
    }
}

impl ChokeSlot for UploadChokeSlot {
    fn send_choke(&mut self) {
        self.0.lock().unwrap().set_local_choking(true);
    }

    fn send_unchoke(&mut self) {
        self.0.lock().unwrap().set_local_choking(false);
    }
}

/// Download-direction membership: pauses/resumes this connection's request
/// pipeline replenishment.
pub struct DownloadChokeSlot(Arc<AtomicBool>);

impl DownloadChokeSlot {
    pub fn new(paused: Arc<AtomicBool>) -> DownloadChokeSlot {
        DownloadChokeSlot(paused)
    }
}

impl ChokeSlot for DownloadChokeSlot {
    fn send_choke(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn send_unchoke(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

//! Group-entry bookkeeping and weight computation (spec.md §4.J "Weight
//! computation"). No teacher precedent exists for this scheduler —
//! `bip_select` covers piece revelation/discovery, never choking — so the
//! weight formulas below are built directly from the spec's description
//! rather than generalized from an existing implementation.

use std::time::{Duration, Instant};

/// A peer's membership state within one choke-group's queue (spec.md
/// "Invariants: a peer is in exactly one of {unlisted, queued, unchoked,
/// snubbed}").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueState {
    Unlisted,
    Queued,
    Unchoked,
    Snubbed,
}

/// Sink the scheduler drives once it decides to choke or unchoke a peer
/// (spec.md "Apply choke/unchoke by invoking the slot provided by each
/// peer, which pushes the corresponding message onto the wire"). Kept
/// decoupled from `tcore_peer::PeerConnection` so this crate doesn't need
/// to depend on the wire protocol crate at all.
pub trait ChokeSlot {
    fn send_choke(&mut self);
    fn send_unchoke(&mut self);
}

/// Width of each of the 4 priority bands (spec.md "4 priority bands, each
/// band of size 2^30").
pub const BAND_SIZE: u64 = 1 << 30;

/// One peer's standing within a choke-group, carrying everything the
/// weight formulas need.
#[derive(Debug)]
pub struct GroupEntry {
    pub(crate) id: u64,
    pub(crate) state: QueueState,
    /// Rate, in bytes/sec, the remote peer is sending us.
    pub(crate) download_rate: u64,
    /// Rate, in bytes/sec, we are sending the remote peer.
    pub(crate) upload_rate: u64,
    /// True if the remote peer currently has us choked.
    pub(crate) remote_choked_us: bool,
    /// True if we recently unchoked this peer (used by the upload-unchoke
    /// weight's middle band).
    pub(crate) recently_unchoked_it: bool,
    pub(crate) last_choke_change: Instant,
}

impl GroupEntry {
    pub fn new(id: u64) -> GroupEntry {
        GroupEntry {
            id,
            state: QueueState::Unlisted,
            download_rate: 0,
            upload_rate: 0,
            remote_choked_us: true,
            recently_unchoked_it: false,
            last_choke_change: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn update_rates(&mut self, download_rate: u64, upload_rate: u64, remote_choked_us: bool) {
        self.download_rate = download_rate;
        self.upload_rate = upload_rate;
        self.remote_choked_us = remote_choked_us;
    }

    pub fn time_since_last_choke_change(&self) -> Duration {
        self.last_choke_change.elapsed()
    }

    /// Minimum throughput (spec.md "transmitting >= 1 KB/s") for the
    /// upload-unchoke weight's middle band.
    const RECENTLY_UNCHOKING_THRESHOLD: u64 = 1024;

    /// Weight used to rank *queued* peers for upload-unchoke promotion
    /// (spec.md §4.J "Upload-unchoke"). Higher is a better candidate;
    /// callers stable-sort ascending and promote from the tail.
    pub fn upload_unchoke_weight(&self, small_random: u64) -> u64 {
        if self.remote_choked_us {
            BAND_SIZE + small_random
        } else if self.recently_unchoked_it && self.download_rate >= Self::RECENTLY_UNCHOKING_THRESHOLD {
            2 * BAND_SIZE + self.download_rate
        } else {
            self.download_rate
        }
    }

    /// Weight used to rank *unchoked* peers for upload-choke demotion
    /// (spec.md "Upload-choke: band_base - 1 - (download_rate/16), prefer
    /// choking the slowest-sending peer"). Re-derives the same band an
    /// unchoke decision would have placed this peer in, then biases within
    /// it so the slowest sender sorts to the tail. Signed so the band-0
    /// case (`band_base == 0`) can still go negative instead of clamping
    /// every band-0 member to the same weight.
    pub fn upload_choke_weight(&self) -> i64 {
        let band_base: i64 = if self.remote_choked_us {
            BAND_SIZE as i64
        } else if self.recently_unchoked_it && self.download_rate >= Self::RECENTLY_UNCHOKING_THRESHOLD {
            2 * BAND_SIZE as i64
        } else {
            0
        };
        band_base - 1 - (self.download_rate as i64 / 16)
    }

    /// Symmetric to `upload_unchoke_weight`, keyed on upload-rate seen from
    /// that peer (spec.md "Download-unchoke / download-choke: symmetric,
    /// keyed on upload-rate").
    pub fn download_unchoke_weight(&self, small_random: u64) -> u64 {
        if self.remote_choked_us {
            BAND_SIZE + small_random
        } else if self.recently_unchoked_it && self.upload_rate >= Self::RECENTLY_UNCHOKING_THRESHOLD {
            2 * BAND_SIZE + self.upload_rate
        } else {
            self.upload_rate
        }
    }

    pub fn download_choke_weight(&self) -> i64 {
        let band_base: i64 = if self.remote_choked_us {
            BAND_SIZE as i64
        } else if self.recently_unchoked_it && self.upload_rate >= Self::RECENTLY_UNCHOKING_THRESHOLD {
            2 * BAND_SIZE as i64
        } else {
            0
        };
        band_base - 1 - (self.upload_rate as i64 / 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_remote_choked_peer_lands_in_band_one() {
        let mut entry = GroupEntry::new(1);
        entry.update_rates(0, 0, true);
        let weight = entry.upload_unchoke_weight(7);
        assert!(weight >= BAND_SIZE && weight < 2 * BAND_SIZE);
    }

    #[test]
    fn positive_fast_recently_unchoked_peer_lands_in_band_two() {
        let mut entry = GroupEntry::new(1);
        entry.recently_unchoked_it = true;
        entry.update_rates(4096, 0, false);
        let weight = entry.upload_unchoke_weight(0);
        assert!(weight >= 2 * BAND_SIZE);
    }

    #[test]
    fn positive_choke_weight_prefers_slowest_sender() {
        let mut slow = GroupEntry::new(1);
        slow.recently_unchoked_it = true;
        slow.update_rates(2048, 0, false);

        let mut fast = GroupEntry::new(2);
        fast.recently_unchoked_it = true;
        fast.update_rates(32_768, 0, false);

        assert!(slow.upload_choke_weight() > fast.upload_choke_weight());
    }
}

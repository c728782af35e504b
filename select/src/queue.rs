//! The weighted choke queue itself (spec.md §4.J "Per-cycle algorithm").
//! One `ChokeQueue` is one direction (upload or download) of one
//! choke-group; `ChokeGroup` pairs the two. Like `group.rs`'s weight
//! formulas, the per-cycle algorithm here has no teacher precedent and is
//! built directly from the spec's prose.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::error::{SelectError, SelectErrorKind};
use crate::group::{ChokeSlot, GroupEntry, QueueState, BAND_SIZE};

/// A peer becoming interested moves it into `Queued`; losing interest or
/// being snubbed moves it out of the unchoke pool even if still a member
/// (spec.md "Event-driven transitions").
const MIN_SECONDS_BETWEEN_CHOKE_CHANGES: Duration = Duration::from_secs(10);

/// Fixed weight tables the adjust budget is distributed across (spec.md
/// "a fixed weight table {1,3,9,0} for upload, {1,1,1,1} for download").
const UPLOAD_BAND_WEIGHTS: [u64; 4] = [1, 3, 9, 0];
const DOWNLOAD_BAND_WEIGHTS: [u64; 4] = [1, 1, 1, 1];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

struct Member<S: ChokeSlot> {
    entry: GroupEntry,
    slot: S,
}

/// One direction's unchoke queue for one choke-group (spec.md "Each
/// choke-group owns an upload-queue and a download-queue").
pub struct ChokeQueue<S: ChokeSlot> {
    direction: Direction,
    /// `None` is the `unlimited` sentinel (spec.md "max_unchoked ...
    /// unlimited sentinel disables the bound").
    max_unchoked: Option<usize>,
    members: HashMap<u64, Member<S>>,
    /// Rotates which band optimistic rotation and residue distribution
    /// start from, "to equalize long-term" (spec.md step 4).
    next_start_band: usize,
}

impl<S: ChokeSlot> ChokeQueue<S> {
    pub fn new(direction: Direction, max_unchoked: Option<usize>) -> ChokeQueue<S> {
        ChokeQueue { direction, max_unchoked, members: HashMap::new(), next_start_band: 0 }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn currently_unchoked(&self) -> usize {
        self.members.values().filter(|m| m.entry.state == QueueState::Unchoked).count()
    }

    pub fn register(&mut self, id: u64, slot: S) -> Result<(), SelectError> {
        if self.members.contains_key(&id) {
            return Err(SelectErrorKind::AlreadyRegistered(id).into());
        }
        self.members.insert(id, Member { entry: GroupEntry::new(id), slot });
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<S> {
        self.members.remove(&id).map(|m| m.slot)
    }

    pub fn update_rates(&mut self, id: u64, download_rate: u64, upload_rate: u64, remote_choked_us: bool) -> Result<(), SelectError> {
        let member = self.members.get_mut(&id).ok_or_else(|| SelectErrorKind::UnknownEntry(id))?;
        member.entry.update_rates(download_rate, upload_rate, remote_choked_us);
        Ok(())
    }

    /// A peer became interested in what we're offering (spec.md
    /// "a peer becoming interested -> set_queued").
    pub fn set_queued(&mut self, id: u64) -> Result<(), SelectError> {
        self.transition(id, QueueState::Queued)
    }

    /// Losing interest (spec.md "losing interest -> set_not_queued").
    pub fn set_not_queued(&mut self, id: u64) -> Result<(), SelectError> {
        self.transition(id, QueueState::Unlisted)
    }

    /// No response for a timeout removes the peer from the queue
    /// regardless of its interest (spec.md "set_snubbed, which removes it
    /// from queue regardless of interest").
    pub fn set_snubbed(&mut self, id: u64) -> Result<(), SelectError> {
        self.transition(id, QueueState::Snubbed)
    }

    fn transition(&mut self, id: u64, new_state: QueueState) -> Result<(), SelectError> {
        let member = self.members.get_mut(&id).ok_or_else(|| SelectErrorKind::UnknownEntry(id))?;
        member.entry.state = new_state;
        Ok(())
    }

    fn band_weights(&self) -> &'static [u64; 4] {
        match self.direction {
            Direction::Upload => &UPLOAD_BAND_WEIGHTS,
            Direction::Download => &DOWNLOAD_BAND_WEIGHTS,
        }
    }

    fn unchoke_weight(&self, entry: &GroupEntry, small_random: u64) -> u64 {
        match self.direction {
            Direction::Upload => entry.upload_unchoke_weight(small_random),
            Direction::Download => entry.download_unchoke_weight(small_random),
        }
    }

    fn choke_weight(&self, entry: &GroupEntry) -> i64 {
        match self.direction {
            Direction::Upload => entry.upload_choke_weight(),
            Direction::Download => entry.download_choke_weight(),
        }
    }

    /// Runs one scheduling cycle. `unchoke_budget` is the resource
    /// manager's cap on how many *additional* unchokes this cycle may
    /// grant (spec.md step 3 "unchoke_budget_from_resource_manager").
    pub fn run_cycle(&mut self, unchoke_budget: usize) {
        let mut rng = rand::thread_rng();

        // Step 1: weigh queued candidates (for promotion) and unchoked
        // members (for forced demotion), stable-sort ascending.
        let mut queued: Vec<(u64, u64)> = self
            .members
            .iter()
            .filter(|(_, m)| m.entry.state == QueueState::Queued)
            .map(|(&id, m)| (id, self.unchoke_weight(&m.entry, rng.gen_range(0..BAND_SIZE))))
            .collect();
        queued.sort_by_key(|&(_, weight)| weight);

        let mut unchoked: Vec<(u64, i64)> = self
            .members
            .iter()
            .filter(|(_, m)| m.entry.state == QueueState::Unchoked)
            .map(|(&id, m)| (id, self.choke_weight(&m.entry)))
            .collect();
        unchoked.sort_by_key(|&(_, weight)| weight);

        // Step 2: force demotion if over the hard cap.
        if let Some(max) = self.max_unchoked {
            while self.currently_unchoked() > max {
                if let Some((id, _)) = unchoked.pop() {
                    self.choke(id);
                } else {
                    break;
                }
            }
        }

        // Step 3: how much room is actually available this cycle.
        let available = self.max_unchoked.map(|max| max.saturating_sub(self.currently_unchoked())).unwrap_or(queued.len());
        let adjust = available.min(unchoke_budget).min(queued.len());

        // Step 4: distribute `adjust` across the 4 bands proportionally,
        // starting the residue from a rotating band.
        let weights = self.band_weights();
        let total_weight: u64 = weights.iter().sum();
        let mut per_band = [0usize; 4];
        if total_weight > 0 {
            for band in 0..4 {
                per_band[band] = (adjust as u64 * weights[band] / total_weight) as usize;
            }
            let mut distributed: usize = per_band.iter().sum();
            let mut band = self.next_start_band;
            while distributed < adjust {
                if weights[band] > 0 {
                    per_band[band] += 1;
                    distributed += 1;
                }
                band = (band + 1) % 4;
            }
            self.next_start_band = (self.next_start_band + 1) % 4;
        }

        for band in 0..4 {
            let lower = band as u64 * BAND_SIZE;
            let upper = lower + BAND_SIZE;
            let mut taken = 0;
            while taken < per_band[band] {
                let position = queued.iter().rposition(|&(_, weight)| weight >= lower && weight < upper);
                match position {
                    Some(index) => {
                        let (id, _) = queued.remove(index);
                        self.unchoke(id);
                        taken += 1;
                    }
                    None => break,
                }
            }
        }

        self.run_optimistic_rotation();
    }

    /// `max_alternate = ceil(currently_unchoked / 8 or 10)` unchoked slots
    /// are swapped each cycle regardless of capacity pressure, so peers
    /// that would otherwise starve under the rate-weighted schedule get a
    /// chance (spec.md "Optimistic rotation").
    fn run_optimistic_rotation(&mut self) {
        const ALTERNATE_DIVISOR: usize = 8;
        let currently_unchoked = self.currently_unchoked();
        if currently_unchoked == 0 {
            return;
        }
        let max_alternate = (currently_unchoked + ALTERNATE_DIVISOR - 1) / ALTERNATE_DIVISOR;
        if max_alternate == 0 {
            return;
        }

        let mut unchoked: Vec<(u64, i64)> = self
            .members
            .iter()
            .filter(|(_, m)| m.entry.state == QueueState::Unchoked && m.entry.time_since_last_choke_change() >= MIN_SECONDS_BETWEEN_CHOKE_CHANGES)
            .map(|(&id, m)| (id, self.choke_weight(&m.entry)))
            .collect();
        // Lowest choke-weight = best-performing peers; these are the ones
        // optimistic rotation deliberately gives up to test new candidates.
        unchoked.sort_by_key(|&(_, weight)| weight);

        let mut queued: Vec<u64> = self.members.iter().filter(|(_, m)| m.entry.state == QueueState::Queued).map(|(&id, _)| id).collect();

        for &(victim_id, _) in unchoked.iter().take(max_alternate) {
            if let Some(replacement) = queued.pop() {
                self.choke(victim_id);
                self.unchoke(replacement);
            }
        }
    }

    /// Demotes a peer back to `Queued`, not `Unlisted` — the peer's
    /// interest hasn't changed, only its place in the schedule has, so it
    /// must stay eligible for re-promotion next cycle (spec.md "a peer is in
    /// exactly one of {unlisted, queued, unchoked, snubbed}"; only
    /// `set_not_queued`/loss of interest moves a peer to `unlisted`).
    fn choke(&mut self, id: u64) {
        if let Some(member) = self.members.get_mut(&id) {
            member.entry.state = QueueState::Queued;
            member.entry.last_choke_change = std::time::Instant::now();
            member.slot.send_choke();
        }
    }

    fn unchoke(&mut self, id: u64) {
        if let Some(member) = self.members.get_mut(&id) {
            member.entry.state = QueueState::Unchoked;
            member.entry.last_choke_change = std::time::Instant::now();
            member.slot.send_unchoke();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSlot {
        choked: u32,
        unchoked: u32,
    }

    impl ChokeSlot for RecordingSlot {
        fn send_choke(&mut self) {
            self.choked += 1;
        }
        fn send_unchoke(&mut self) {
            self.unchoked += 1;
        }
    }

    #[test]
    fn positive_queued_peer_is_promoted_when_room_available() {
        let mut queue: ChokeQueue<RecordingSlot> = ChokeQueue::new(Direction::Upload, Some(4));
        queue.register(1, RecordingSlot::default()).unwrap();
        queue.set_queued(1).unwrap();
        queue.update_rates(1, 10_000, 0, false).unwrap();

        queue.run_cycle(4);

        assert_eq!(queue.currently_unchoked(), 1);
        assert_eq!(queue.members.get(&1).unwrap().slot.unchoked, 1);
    }

    #[test]
    fn positive_budget_of_zero_promotes_nobody() {
        let mut queue: ChokeQueue<RecordingSlot> = ChokeQueue::new(Direction::Upload, Some(4));
        queue.register(1, RecordingSlot::default()).unwrap();
        queue.set_queued(1).unwrap();

        queue.run_cycle(0);

        assert_eq!(queue.currently_unchoked(), 0);
    }

    #[test]
    fn positive_over_capacity_demotes_the_slowest_sender() {
        let mut queue: ChokeQueue<RecordingSlot> = ChokeQueue::new(Direction::Upload, Some(1));
        queue.register(1, RecordingSlot::default()).unwrap();
        queue.register(2, RecordingSlot::default()).unwrap();
        queue.set_queued(1).unwrap();
        queue.set_queued(2).unwrap();
        queue.update_rates(1, 100, 0, false).unwrap();
        queue.update_rates(2, 100_000, 0, false).unwrap();

        // Manually place both unchoked to simulate a prior cycle, then tighten the cap.
        queue.unchoke(1);
        queue.unchoke(2);
        assert_eq!(queue.currently_unchoked(), 2);

        queue.run_cycle(0);
        assert_eq!(queue.currently_unchoked(), 1);
    }
}

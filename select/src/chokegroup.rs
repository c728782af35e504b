//! Pairs one torrent's upload and download unchoke queues (spec.md §4.J
//! "Each choke-group owns an upload-queue and a download-queue"), and
//! migrates a whole torrent's membership between groups atomically when a
//! download moves between choke-groups.

use crate::error::SelectError;
use crate::group::ChokeSlot;
use crate::queue::{ChokeQueue, Direction};

pub struct ChokeGroup<S: ChokeSlot> {
    upload: ChokeQueue<S>,
    download: ChokeQueue<S>,
}

impl<S: ChokeSlot> ChokeGroup<S> {
    pub fn new(max_upload_unchoked: Option<usize>, max_download_unchoked: Option<usize>) -> ChokeGroup<S> {
        ChokeGroup {
            upload: ChokeQueue::new(Direction::Upload, max_upload_unchoked),
            download: ChokeQueue::new(Direction::Download, max_download_unchoked),
        }
    }

    pub fn upload(&self) -> &ChokeQueue<S> {
        &self.upload
    }

    pub fn upload_mut(&mut self) -> &mut ChokeQueue<S> {
        &mut self.upload
    }

    pub fn download(&self) -> &ChokeQueue<S> {
        &self.download
    }

    pub fn download_mut(&mut self) -> &mut ChokeQueue<S> {
        &mut self.download
    }

    /// Run both directions' scheduling cycles with the budgets the resource
    /// manager handed out this tick (spec.md step 3's
    /// `unchoke_budget_from_resource_manager`).
    pub fn run_cycle(&mut self, upload_budget: usize, download_budget: usize) {
        self.upload.run_cycle(upload_budget);
        self.download.run_cycle(download_budget);
    }
}

/// Atomically remove a peer from one group's upload+download queues and
/// register it (with fresh slots) in another, so a download migrating
/// between choke-groups never leaves a peer double-counted or orphaned
/// (spec.md §4.K "Moving a download between groups atomically migrates all
/// its peers and updates the source/destination queued/unchoked counters").
pub fn migrate<S: ChokeSlot>(
    from: &mut ChokeGroup<S>,
    to: &mut ChokeGroup<S>,
    id: u64,
    upload_slot: S,
    download_slot: S,
) -> Result<(), SelectError> {
    from.upload_mut().remove(id);
    from.download_mut().remove(id);
    to.upload_mut().register(id, upload_slot)?;
    to.download_mut().register(id, download_slot)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct NullSlot;
    impl ChokeSlot for NullSlot {
        fn send_choke(&mut self) {}
        fn send_unchoke(&mut self) {}
    }

    #[test]
    fn positive_migrate_moves_membership_between_groups() {
        let mut group_a: ChokeGroup<NullSlot> = ChokeGroup::new(Some(4), Some(4));
        let mut group_b: ChokeGroup<NullSlot> = ChokeGroup::new(Some(4), Some(4));

        group_a.upload_mut().register(1, NullSlot).unwrap();
        group_a.download_mut().register(1, NullSlot).unwrap();
        assert_eq!(group_a.upload().len(), 1);

        migrate(&mut group_a, &mut group_b, 1, NullSlot, NullSlot).unwrap();

        assert_eq!(group_a.upload().len(), 0);
        assert_eq!(group_a.download().len(), 0);
        assert_eq!(group_b.upload().len(), 1);
        assert_eq!(group_b.download().len(), 1);
    }
}

//! Attach, detach and local failure handling.

use std::sync::atomic::Ordering;

use tracing::{error, info, warn};

use super::{Effects, Resource};
use crate::bitmap::BmLockFlags;
use crate::config::OnIoError;
use crate::error::ReplResult;
use crate::events::StateEvent;
use crate::generation::GenerationIds;
use crate::state::{ChangeFlags, DiskState};
use crate::types::VolumeId;

/// How to bring a backing device in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOptions {
    /// Start with fresh metadata: clear the bitmap, format the activity log.
    pub format: bool,
    /// The device was shut down cleanly; skip the activity log recovery.
    pub clean: bool,
    /// Disk state once attached.
    pub disk: DiskState,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            format: false,
            clean: true,
            disk: DiskState::UpToDate,
        }
    }
}

impl Resource {
    /// Attaches the backing device of `volume`: loads (or formats) the
    /// bitmap and the activity log and, after an unclean shutdown, marks
    /// every extent of the replayed log out of sync for all peers.
    pub fn attach(&self, volume: VolumeId, opts: AttachOptions) -> ReplResult<()> {
        let device = self.device(volume)?.clone();
        self.change(ChangeFlags::VERBOSE, |s| {
            if let Some(d) = s.devices.get_mut(&volume) {
                d.disk = DiskState::Attaching;
            }
        })?;

        let planes: Vec<u32> = (0..device.bitmap.planes()).collect();
        let loaded: ReplResult<u64> = (|| {
            if opts.format {
                {
                    let guard = device.bitmap.lock("format", BmLockFlags::ALL, None);
                    for &plane in &planes {
                        guard.clear_all(plane)?;
                    }
                }
                device.bitmap.write_full()?;
                device.al.lock().initialize()?;
                *device.generation.lock() = GenerationIds::just_created();
                return Ok(0);
            }
            device.bitmap.lock("attach", BmLockFlags::ALL, None).read()?;
            let mut al = device.al.lock();
            let replay = al.read_log()?;
            info!(
                volume = %volume,
                transactions = replay.transactions,
                torn = replay.torn,
                extents = replay.extents.len(),
                "activity log replayed"
            );
            if opts.clean {
                return Ok(0);
            }
            let set = al.apply_to_bitmap(&planes)?;
            drop(al);
            device.bitmap.write_hinted()?;
            Ok(set)
        })();

        match loaded {
            Ok(set) => {
                device.was_io_error.store(false, Ordering::Release);
                self.change(ChangeFlags::VERBOSE, |s| {
                    if let Some(d) = s.devices.get_mut(&volume) {
                        d.disk = opts.disk;
                    }
                })?;
                info!(
                    resource = %self.name,
                    volume = %volume,
                    disk = ?opts.disk,
                    recovered_bits = set,
                    "attached"
                );
                Ok(())
            }
            Err(e) => {
                self.handle_meta_error(volume, &e.to_string());
                Err(e)
            }
        }
    }

    /// Detaches the backing device of `volume` once its local I/O drained.
    pub fn detach(&self, volume: VolumeId) -> ReplResult<()> {
        let device = self.device(volume)?.clone();
        if let Err(e) = device.bitmap.write_full() {
            warn!(volume = %volume, error = %e, "bitmap not written on detach");
        }
        self.change(ChangeFlags::VERBOSE, |s| {
            if let Some(d) = s.devices.get_mut(&volume) {
                d.disk = DiskState::Detaching;
            }
        })?;
        info!(resource = %self.name, volume = %volume, in_flight = device.local_cnt(), "detaching");
        Ok(())
    }

    /// A local I/O on `volume` failed. Only the first error since the last
    /// attach counts.
    pub(super) fn local_io_error(&self, volume: VolumeId) {
        let Some(device) = self.devices.get(&volume) else {
            return;
        };
        if device.was_io_error.swap(true, Ordering::AcqRel) {
            return;
        }
        self.events.publish(StateEvent::IoError { volume });
        let target = match self.config.disk.on_io_error {
            OnIoError::Detach => DiskState::Failed,
            OnIoError::PassOn => DiskState::Inconsistent,
        };
        let result = self.change(ChangeFlags::HARD, |s| {
            if let Some(d) = s.devices.get_mut(&volume) {
                if d.disk > target {
                    d.disk = target;
                }
            }
        });
        match result {
            Ok(()) if target == DiskState::Failed => {
                error!(resource = %self.name, volume = %volume, "local I/O error, disk failed")
            }
            Ok(()) => warn!(resource = %self.name, volume = %volume, "local I/O error passed on, disk inconsistent"),
            Err(e) => warn!(volume = %volume, error = %e, "cannot downgrade the disk"),
        }
    }

    /// Metadata of `volume` is unusable: the disk fails and detaches.
    pub(super) fn handle_meta_error(&self, volume: VolumeId, msg: &str) {
        error!(resource = %self.name, volume = %volume, error = msg, "metadata error");
        let result = self.change(ChangeFlags::HARD, |s| {
            if let Some(d) = s.devices.get_mut(&volume) {
                if !matches!(d.disk, DiskState::Diskless | DiskState::Failed) {
                    d.disk = DiskState::Failed;
                }
            }
        });
        if let Err(e) = result {
            warn!(volume = %volume, error = %e, "cannot fail the disk");
        }
    }

    /// Completes a detach once no local I/O is in flight.
    pub(super) fn maybe_finish_detach(&self, volume: VolumeId) {
        let Some(device) = self.devices.get(&volume) else {
            return;
        };
        let mut fx = Effects::default();
        {
            let mut inner = self.inner.lock();
            let disk = inner.states.disk(volume);
            if !matches!(disk, DiskState::Failed | DiskState::Detaching) || device.local_cnt() > 0 {
                return;
            }
            let result = self.change_locked(&mut inner, &mut fx, ChangeFlags::HARD, |s| {
                if let Some(d) = s.devices.get_mut(&volume) {
                    d.disk = DiskState::Diskless;
                }
            });
            if let Err(e) = result {
                warn!(volume = %volume, error = %e, "cannot finish detach");
            }
        }
        self.run_effects(fx);
    }
}


//! Disk-health observer registration and fan-out.
//!
//! Writers register with the [`DeviceMonitor`] while they hold an open
//! file on a mount and unregister on close, destroy or after receiving an
//! error. The monitor holds only weak references: registration is bare
//! membership, never ownership of the writer's lifetime. Health probing
//! itself happens elsewhere; this module is just the callback plumbing.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Condition of a mount as reported by disk probing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiskStatus {
    Healthy,
    ReadOnly,
    IoHang,
    HighUsage,
    Failed,
}

impl fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DiskStatus::Healthy => "healthy",
            DiskStatus::ReadOnly => "read-only",
            DiskStatus::IoHang => "io-hang",
            DiskStatus::HighUsage => "high-usage",
            DiskStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Receives disk-health callbacks for the mount it registered under.
pub trait DeviceObserver: Send + Sync {
    /// The mount became unusable. Observers are expected to poison
    /// themselves; the monitor takes no further action.
    fn notify_device_error(&self, mount: &Path, status: DiskStatus);

    /// The mount recovered. A no-op at the write-path layer.
    fn notify_healthy(&self, _mount: &Path) {}

    /// The mount is filling up. A no-op at the write-path layer.
    fn notify_high_disk_usage(&self, _mount: &Path) {}
}

/// Token returned by [`DeviceMonitor::register`], used to unregister.
pub type ObserverId = u64;

struct Registration {
    mount: PathBuf,
    observer: Weak<dyn DeviceObserver>,
}

/// Membership list of observers, keyed by registration token.
#[derive(Default)]
pub struct DeviceMonitor {
    observers: Mutex<HashMap<ObserverId, Registration>>,
    next_id: AtomicU64,
}

impl DeviceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for callbacks about `mount`.
    pub fn register(&self, mount: impl Into<PathBuf>, observer: Weak<dyn DeviceObserver>) -> ObserverId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().insert(
            id,
            Registration {
                mount: mount.into(),
                observer,
            },
        );
        id
    }

    /// Drop a registration. Unknown ids are ignored, so unregistering
    /// twice (close then destroy, say) is harmless.
    pub fn unregister(&self, id: ObserverId) {
        self.observers.lock().remove(&id);
    }

    /// Observers currently registered, dead or alive. For tests.
    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Report `mount` as broken to every observer registered under it.
    pub fn report_error(&self, mount: &Path, status: DiskStatus) {
        self.for_each_on(mount, |observer| observer.notify_device_error(mount, status));
    }

    pub fn report_healthy(&self, mount: &Path) {
        self.for_each_on(mount, |observer| observer.notify_healthy(mount));
    }

    pub fn report_high_usage(&self, mount: &Path) {
        self.for_each_on(mount, |observer| observer.notify_high_disk_usage(mount));
    }

    /// Invoke `f` on live observers for `mount`, pruning dead weak refs.
    ///
    /// The strong refs are collected before invoking callbacks so an
    /// observer that unregisters itself mid-callback does not deadlock on
    /// the membership lock.
    fn for_each_on(&self, mount: &Path, f: impl Fn(&dyn DeviceObserver)) {
        let targets: Vec<_> = {
            let mut observers = self.observers.lock();
            observers.retain(|_, reg| reg.observer.strong_count() > 0);
            observers
                .values()
                .filter(|reg| reg.mount == mount)
                .filter_map(|reg| reg.observer.upgrade())
                .collect()
        };
        for observer in targets {
            f(observer.as_ref());
        }
    }
}

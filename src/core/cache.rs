use crate::core::database::{ChangedInfo, FullPackageInfo, PackageDatabase};
use crate::Result;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Thread-safe holder of the current [`PackageDatabase`] snapshot.
///
/// Reads are a lock-free atomic snapshot load; writers serialize on one
/// mutex around the read-modify-swap of the pointer. Change events fire
/// outside the lock, so handlers may safely re-enter `db()` or `add()`.
///
/// Consumers must not cache a `db()` reference across an await boundary
/// and expect it to stay current - always re-read after a suspension.
pub struct PackageCache {
    current: ArcSwap<PackageDatabase>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<Arc<ChangedInfo>>,
}

impl PackageCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(crate::constants::EVENT_CHANNEL_CAPACITY);
        Self {
            current: ArcSwap::new(PackageDatabase::empty()),
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// The current immutable snapshot.
    pub fn db(&self) -> Arc<PackageDatabase> {
        self.current.load_full()
    }

    /// Receives a [`ChangedInfo`] for every `add` that changed the
    /// database.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangedInfo>> {
        self.events.subscribe()
    }

    /// Registers a batch against the current snapshot and swaps in the new
    /// database. A no-op batch leaves the snapshot pointer untouched and
    /// emits no event.
    pub fn add(&self, infos: &[FullPackageInfo]) -> Result<Arc<ChangedInfo>> {
        let changed = {
            let _guard = self.write_lock.lock();
            let db = self.current.load_full();
            let changed = db.add(infos)?;
            if changed.has_changed {
                self.current.store(changed.db.clone());
            }
            Arc::new(changed)
        };
        if changed.has_changed {
            // Nobody listening is fine.
            let _ = self.events.send(changed.clone());
        }
        Ok(changed)
    }

    /// Serializes the current snapshot.
    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        self.db().write(out)
    }

    /// Replaces the snapshot with a deserialized database. On error the
    /// previous in-memory snapshot is untouched.
    pub fn read<R: Read>(&self, input: &mut R) -> Result<()> {
        let db = PackageDatabase::read(input)?;
        let _guard = self.write_lock.lock();
        self.current.store(db);
        Ok(())
    }

    pub fn save_file(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(std::fs::File::create(path)?);
        self.write(&mut out)?;
        out.flush()?;
        info!(path = %path.display(), "package cache saved");
        Ok(())
    }

    pub fn load_file(&self, path: &Path) -> Result<()> {
        let mut input = BufReader::new(std::fs::File::open(path)?);
        match self.read(&mut input) {
            Ok(()) => {
                info!(
                    path = %path.display(),
                    packages = self.db().instances().len(),
                    "package cache loaded"
                );
                Ok(())
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load package cache");
                Err(e)
            }
        }
    }
}

impl Default for PackageCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::database::PackageEventType;

    fn info(key: &str, feeds: &[&str]) -> FullPackageInfo {
        let mut i = FullPackageInfo::new(key.parse().unwrap());
        i.feed_names = feeds.iter().map(|s| s.to_string()).collect();
        i.all_feed_names_are_known = true;
        i
    }

    #[test]
    fn add_swaps_snapshot_and_fires_event() {
        let cache = PackageCache::new();
        let before = cache.db();
        let mut rx = cache.subscribe();

        let changed = cache.add(&[info("NuGet:Foo@1.0.0", &["nuget.org"])]).unwrap();
        assert!(changed.has_changed);
        assert!(!Arc::ptr_eq(&before, &cache.db()));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.package_changes[0].event, PackageEventType::ADDED);
        // The old snapshot is still a valid, unchanged database.
        assert!(before.instances().is_empty());
    }

    #[test]
    fn noop_add_keeps_snapshot_and_stays_silent() {
        let cache = PackageCache::new();
        cache.add(&[info("NuGet:Foo@1.0.0", &["nuget.org"])]).unwrap();
        let db = cache.db();
        let mut rx = cache.subscribe();

        let changed = cache.add(&[info("NuGet:Foo@1.0.0", &["nuget.org"])]).unwrap();
        assert!(!changed.has_changed);
        assert!(Arc::ptr_eq(&db, &cache.db()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failed_read_leaves_snapshot_untouched() {
        let cache = PackageCache::new();
        cache.add(&[info("NuGet:Foo@1.0.0", &[])]).unwrap();
        let db = cache.db();

        let garbage = [0xffu8, 0xff, 0xff, 0xff, 0xff];
        assert!(cache.read(&mut &garbage[..]).is_err());
        assert!(Arc::ptr_eq(&db, &cache.db()));
    }
}

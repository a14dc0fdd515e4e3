use crate::core::artifact::{is_valid_part, Artifact, ArtifactInstance};
use crate::core::feed::{FeedChangedInfo, PackageFeed};
use crate::core::package::{
    DependencyKind, PackageInstance, PackageQuality, PackageState, Reference, SavorSet,
    VersionLock,
};
use crate::core::store::{InstanceStore, StoreEdit};
use crate::{DepotError, Result};
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// One dependency of a [`FullPackageInfo`] candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    pub target: ArtifactInstance,
    pub lock: VersionLock,
    pub min_quality: PackageQuality,
    pub kind: DependencyKind,
    pub savors: Option<SavorSet>,
}

/// Everything a caller (or the live layer) knows about one package when
/// registering it: identity, savors, state, dependencies, and claimed feed
/// membership.
///
/// `all_feed_names_are_known` tells the database whether `feed_names` is
/// exhaustive: when true, feeds currently holding the package but absent
/// from the list lose it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullPackageInfo {
    pub key: ArtifactInstance,
    pub savors: Option<SavorSet>,
    pub state: PackageState,
    pub dependencies: Vec<DependencyInfo>,
    pub feed_names: Vec<String>,
    pub all_feed_names_are_known: bool,
}

impl FullPackageInfo {
    pub fn new(key: ArtifactInstance) -> Self {
        Self {
            key,
            savors: None,
            state: PackageState::empty(),
            dependencies: Vec::new(),
            feed_names: Vec::new(),
            all_feed_names_are_known: false,
        }
    }

    /// Content equality as the database sees it: savors and dependency
    /// list, ignoring state and feed membership.
    pub fn same_content(&self, other: &FullPackageInfo) -> bool {
        self.key == other.key
            && self.savors == other.savors
            && self.dependencies == other.dependencies
    }
}

bitflags! {
    /// What happened to one package during an `add`. Empty means no change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PackageEventType: u8 {
        const ADDED = 0b0000_0001;
        const CONTENT_CHANGED = 0b0000_0010;
        const STATE_CHANGED = 0b0000_0100;
    }
}

/// Per-package change record of an `add`.
#[derive(Debug, Clone)]
pub struct PackageChangedInfo {
    pub key: ArtifactInstance,
    pub event: PackageEventType,
}

/// Result of [`PackageDatabase::add`]: the (possibly unchanged) database
/// plus every package-level and feed-level change.
///
/// When nothing changed, `db` is the very same `Arc` the call was made on -
/// callers rely on this reference stability to skip redundant event
/// dispatch.
#[derive(Debug, Clone)]
pub struct ChangedInfo {
    pub db: Arc<PackageDatabase>,
    pub has_changed: bool,
    pub package_changes: Vec<PackageChangedInfo>,
    pub new_feeds: Vec<Artifact>,
    pub feed_changes: Vec<FeedChangedInfo>,
}

/// The immutable package database: one global [`InstanceStore`] plus a map
/// of named [`PackageFeed`]s.
///
/// Every feed instance is present (by identity) in the global store, and
/// every dependency target of every instance resolves in the global store.
/// Each successful `add` produces a new database; old snapshots remain
/// valid for concurrent readers.
#[derive(Debug)]
pub struct PackageDatabase {
    instances: InstanceStore,
    feeds: FxHashMap<String, PackageFeed>,
    last_update: DateTime<Utc>,
    update_serial_number: u64,
}

impl PackageDatabase {
    /// The empty root database.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            instances: InstanceStore::empty(),
            feeds: FxHashMap::default(),
            last_update: DateTime::UNIX_EPOCH,
            update_serial_number: 0,
        })
    }

    pub(crate) fn from_parts(
        instances: InstanceStore,
        feeds: FxHashMap<String, PackageFeed>,
        last_update: DateTime<Utc>,
        update_serial_number: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            instances,
            feeds,
            last_update,
            update_serial_number,
        })
    }

    pub fn instances(&self) -> &InstanceStore {
        &self.instances
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub fn update_serial_number(&self) -> u64 {
        self.update_serial_number
    }

    pub fn find(&self, key: &ArtifactInstance) -> Option<&Arc<PackageInstance>> {
        self.instances.find(key)
    }

    pub fn find_with_ghosts(&self, key: &ArtifactInstance) -> Option<&Arc<PackageInstance>> {
        self.instances.find_with_ghosts(key)
    }

    pub fn feeds(&self) -> impl Iterator<Item = &PackageFeed> {
        self.feeds.values()
    }

    pub fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    /// Feed lookup by `Type:Name`.
    pub fn find_feed(&self, typed_name: &str) -> Option<&PackageFeed> {
        self.feeds.get(typed_name)
    }

    /// Batched registration: validates, classifies against the current
    /// store, resolves dependency targets, reconciles feed membership, and
    /// rebuilds the store and every touched feed exactly once.
    ///
    /// Any validation or missing-dependency failure aborts the whole batch
    /// with no partial effect.
    pub fn add(self: Arc<Self>, infos: &[FullPackageInfo]) -> Result<ChangedInfo> {
        // Validation: each candidate independently, whole batch aborts on
        // the first failure.
        let mut batch_keys: HashSet<&ArtifactInstance> = HashSet::with_capacity(infos.len());
        let mut candidates = Vec::with_capacity(infos.len());
        for info in infos {
            if !batch_keys.insert(&info.key) {
                return Err(invalid(&info.key, "duplicate key in batch"));
            }
            candidates.push(self.validate(info)?);
        }

        // Classification and dependency-target resolution. Insertion
        // points are all computed against the current store; the merge in
        // `with_edits` splices them in one pass.
        let mut store_edits: Vec<StoreEdit> = Vec::new();
        let mut changes: Vec<PackageChangedInfo> = Vec::new();
        let mut missing: Vec<ArtifactInstance> = Vec::new();
        let mut earlier: HashSet<&ArtifactInstance> = HashSet::with_capacity(infos.len());
        // Final instance per candidate plus whether it is a replacement.
        let mut resolved: Vec<(Arc<PackageInstance>, bool)> = Vec::with_capacity(infos.len());

        for c in &candidates {
            let key = &c.info.key;
            match self.instances.index_of(key) {
                Err(at) => {
                    self.check_targets(&c.deps, &earlier, &mut missing);
                    let instance = Arc::new(PackageInstance::new(
                        key.clone(),
                        c.info.savors.clone(),
                        c.info.state,
                        c.deps.clone(),
                    ));
                    store_edits.push(StoreEdit::Insert {
                        at,
                        instance: instance.clone(),
                    });
                    changes.push(PackageChangedInfo {
                        key: key.clone(),
                        event: PackageEventType::ADDED,
                    });
                    resolved.push((instance, false));
                }
                Ok(at) => {
                    let existing = &self.instances.instances()[at];
                    let mut event = PackageEventType::empty();
                    if existing.savors() != c.info.savors.as_ref()
                        || existing.dependencies() != c.deps.as_slice()
                    {
                        // Content drift for an existing version is a caller
                        // bug; the database repairs itself by accepting the
                        // new content.
                        warn!(package = %key, "content of already registered package differs, updating");
                        event |= PackageEventType::CONTENT_CHANGED;
                    }
                    if existing.state() != c.info.state {
                        event |= PackageEventType::STATE_CHANGED;
                    }
                    if event.is_empty() {
                        resolved.push((existing.clone(), false));
                    } else {
                        self.check_targets(&c.deps, &earlier, &mut missing);
                        let instance = Arc::new(PackageInstance::new(
                            key.clone(),
                            c.info.savors.clone(),
                            c.info.state,
                            c.deps.clone(),
                        ));
                        store_edits.push(StoreEdit::Replace {
                            at,
                            instance: instance.clone(),
                        });
                        changes.push(PackageChangedInfo {
                            key: key.clone(),
                            event,
                        });
                        resolved.push((instance, true));
                    }
                }
            }
            earlier.insert(key);
        }

        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(DepotError::MissingDependencies(missing));
        }

        // Feed reconciliation, accumulated per feed across the whole batch
        // and applied once per feed.
        #[derive(Default)]
        struct FeedEdits {
            added: Vec<Arc<PackageInstance>>,
            updated: Vec<Arc<PackageInstance>>,
            removed: Vec<ArtifactInstance>,
        }
        let mut feed_edits: FxHashMap<String, FeedEdits> = FxHashMap::default();
        let mut created: Vec<(Artifact, Vec<Arc<PackageInstance>>)> = Vec::new();

        for (c, (instance, replaced)) in candidates.iter().zip(&resolved) {
            let key = &c.info.key;
            for feed in self.feeds.values() {
                if feed.artifact_type() != key.artifact_type() {
                    continue;
                }
                let declared = c.feed_ids.contains(feed.identity());
                let contains = feed.contains(key);
                if contains && !declared && c.info.all_feed_names_are_known {
                    feed_edits
                        .entry(feed.typed_name())
                        .or_default()
                        .removed
                        .push(key.clone());
                } else if contains && *replaced {
                    feed_edits
                        .entry(feed.typed_name())
                        .or_default()
                        .updated
                        .push(instance.clone());
                } else if !contains && declared {
                    feed_edits
                        .entry(feed.typed_name())
                        .or_default()
                        .added
                        .push(instance.clone());
                }
            }
            for identity in &c.feed_ids {
                if self.feeds.contains_key(&identity.typed_name()) {
                    continue;
                }
                match created.iter_mut().find(|(id, _)| id == identity) {
                    Some((_, members)) => {
                        if !members.iter().any(|m| m.key() == key) {
                            members.push(instance.clone());
                        }
                    }
                    None => created.push((identity.clone(), vec![instance.clone()])),
                }
            }
        }

        let feed_touched = feed_edits
            .values()
            .any(|e| !e.added.is_empty() || !e.updated.is_empty() || !e.removed.is_empty());
        if store_edits.is_empty() && !feed_touched && created.is_empty() {
            // Reference-stable no-op.
            return Ok(ChangedInfo {
                db: self,
                has_changed: false,
                package_changes: Vec::new(),
                new_feeds: Vec::new(),
                feed_changes: Vec::new(),
            });
        }

        let mut feeds = self.feeds.clone();
        let mut feed_changes = Vec::new();
        let mut new_feeds = Vec::new();
        for (typed_name, edits) in feed_edits {
            let feed = &self.feeds[&typed_name];
            let (rebuilt, info) = feed.apply_diff(edits.added, edits.updated, edits.removed);
            if info.has_changed() {
                feed_changes.push(info);
            }
            feeds.insert(typed_name, rebuilt);
        }
        for (identity, members) in created {
            let empty = PackageFeed::new(identity.clone(), InstanceStore::empty());
            let (feed, info) = empty.apply_diff(members, Vec::new(), Vec::new());
            debug!(feed = %identity, "creating feed");
            feed_changes.push(info);
            new_feeds.push(identity);
            feeds.insert(feed.typed_name(), feed);
        }

        let db = Arc::new(PackageDatabase {
            instances: self.instances.with_edits(store_edits),
            feeds,
            last_update: Utc::now(),
            update_serial_number: self.update_serial_number + 1,
        });
        debug!(
            serial = db.update_serial_number,
            packages = changes.len(),
            feeds = feed_changes.len(),
            "database updated"
        );
        Ok(ChangedInfo {
            db,
            has_changed: true,
            package_changes: changes,
            new_feeds,
            feed_changes,
        })
    }

    fn check_targets(
        &self,
        deps: &[Reference],
        earlier: &HashSet<&ArtifactInstance>,
        missing: &mut Vec<ArtifactInstance>,
    ) {
        for d in deps {
            let t = d.base_target();
            if !earlier.contains(t) && self.instances.find_with_ghosts(t).is_none() {
                missing.push(t.clone());
            }
        }
    }

    /// Per-candidate validation and canonicalization.
    fn validate<'a>(&self, info: &'a FullPackageInfo) -> Result<Candidate<'a>> {
        let key = &info.key;
        let mut feed_ids = Vec::with_capacity(info.feed_names.len());
        for name in &info.feed_names {
            let identity = match name.split_once(':') {
                Some((t, n)) => {
                    if t != key.artifact_type() {
                        return Err(invalid(
                            key,
                            &format!("feed '{}' has a different artifact type", name),
                        ));
                    }
                    Artifact::new(t, n)
                        .map_err(|e| invalid(key, &format!("invalid feed name '{}': {}", name, e)))?
                }
                None => {
                    if !is_valid_part(name) {
                        return Err(invalid(key, &format!("invalid feed name '{}'", name)));
                    }
                    Artifact::new(key.artifact_type(), name.as_str())
                        .map_err(|e| invalid(key, &format!("invalid feed name '{}': {}", name, e)))?
                }
            };
            if feed_ids.contains(&identity) {
                return Err(invalid(key, &format!("duplicate feed name '{}'", name)));
            }
            feed_ids.push(identity);
        }

        let mut deps = Vec::with_capacity(info.dependencies.len());
        for d in &info.dependencies {
            if d.kind == DependencyKind::None {
                return Err(invalid(
                    key,
                    &format!("dependency '{}' has kind None", d.target),
                ));
            }
            let savors = match (&info.savors, &d.savors) {
                (_, None) => None,
                (None, Some(_)) => {
                    return Err(invalid(
                        key,
                        &format!("dependency '{}' has savors but the package has none", d.target),
                    ));
                }
                (Some(own), Some(dep)) => {
                    if !dep.is_subset_of(own) {
                        return Err(invalid(
                            key,
                            &format!(
                                "savors of dependency '{}' ({}) are not a subset of the package savors ({})",
                                d.target, dep, own
                            ),
                        ));
                    }
                    // A subset equal to the owner's savors adds no
                    // information: normalize to None to keep equality and
                    // serialization canonical.
                    if dep == own {
                        None
                    } else {
                        Some(dep.clone())
                    }
                }
            };
            deps.push(Reference::new(
                d.target.clone(),
                d.lock,
                d.min_quality,
                d.kind,
                savors,
            ));
        }
        Ok(Candidate {
            info,
            deps,
            feed_ids,
        })
    }
}

struct Candidate<'a> {
    info: &'a FullPackageInfo,
    deps: Vec<Reference>,
    feed_ids: Vec<Artifact>,
}

fn invalid(key: &ArtifactInstance, reason: &str) -> DepotError {
    DepotError::InvalidPackageInfo {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

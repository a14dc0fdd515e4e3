use crate::core::artifact::{Artifact, ArtifactInstance};
use crate::core::package::{PackageInstance, PackageQuality, PackageState};
use crate::core::store::{InstanceStore, StoreEdit};
use std::sync::Arc;

/// A named, type-homogeneous view over the database: the set of packages
/// known (or claimed) to exist in one source.
///
/// The feed identity is an [`Artifact`] whose type is the artifact type the
/// feed carries and whose name is the feed name, e.g. `NuGet:nuget.org`.
/// Every instance in a feed has that same artifact type.
#[derive(Debug, Clone)]
pub struct PackageFeed {
    identity: Artifact,
    instances: InstanceStore,
}

impl PackageFeed {
    pub(crate) fn new(identity: Artifact, instances: InstanceStore) -> Self {
        debug_assert!(instances
            .instances()
            .iter()
            .all(|p| p.key().artifact_type() == identity.artifact_type()));
        Self {
            identity,
            instances,
        }
    }

    pub fn identity(&self) -> &Artifact {
        &self.identity
    }

    pub fn artifact_type(&self) -> &str {
        self.identity.artifact_type()
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn typed_name(&self) -> String {
        self.identity.typed_name()
    }

    pub fn instances(&self) -> &InstanceStore {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn contains(&self, key: &ArtifactInstance) -> bool {
        self.instances.index_of(key).is_ok()
    }

    /// Point lookup in this feed; ghosts are hidden as in the store.
    pub fn find(&self, key: &ArtifactInstance) -> Option<&Arc<PackageInstance>> {
        self.instances.find(key)
    }

    /// All versions of `name` in this feed, newest first.
    pub fn instances_of(&self, name: &str) -> &[Arc<PackageInstance>] {
        match Artifact::new(self.artifact_type(), name) {
            Ok(artifact) => self.instances.instances_of(&artifact),
            Err(_) => &[],
        }
    }

    /// Folds every listed version of `name` into the best instance per
    /// quality tier. Ghost and unlisted instances are not available.
    pub fn available_instances(&self, name: &str) -> PackageQualityVector {
        let mut vector = PackageQualityVector::default();
        for p in self.instances_of(name) {
            if p.is_ghost() || p.state().contains(PackageState::UNLISTED) {
                continue;
            }
            vector.apply(p.clone());
        }
        vector
    }

    /// Applies a whole batch of feed mutations at once, producing the new
    /// feed and the change record. `PackageDatabase::add` accumulates all
    /// of a batch's mutations per feed so a feed is rebuilt once, not once
    /// per touched package.
    ///
    /// `updated` carries replacement instances for keys already in the
    /// feed (a content/state change does not emit a feed-level event).
    pub(crate) fn apply_diff(
        &self,
        added: Vec<Arc<PackageInstance>>,
        updated: Vec<Arc<PackageInstance>>,
        removed: Vec<ArtifactInstance>,
    ) -> (PackageFeed, FeedChangedInfo) {
        let mut edits = Vec::with_capacity(added.len() + updated.len() + removed.len());
        let mut info = FeedChangedInfo {
            feed: self.identity.clone(),
            added: Vec::with_capacity(added.len()),
            removed: Vec::with_capacity(removed.len()),
        };
        for instance in added {
            let at = self
                .instances
                .index_of(instance.key())
                .expect_err("added instance already present in feed");
            info.added.push(instance.key().clone());
            edits.push(StoreEdit::Insert { at, instance });
        }
        for instance in updated {
            if let Ok(at) = self.instances.index_of(instance.key()) {
                edits.push(StoreEdit::Replace { at, instance });
            }
        }
        for key in removed {
            if let Ok(at) = self.instances.index_of(&key) {
                info.removed.push(key);
                edits.push(StoreEdit::Remove { at });
            }
        }
        let feed = PackageFeed {
            identity: self.identity.clone(),
            instances: self.instances.with_edits(edits),
        };
        (feed, info)
    }
}

/// Per-feed change record produced by a database `add`.
#[derive(Debug, Clone)]
pub struct FeedChangedInfo {
    pub feed: Artifact,
    pub added: Vec<ArtifactInstance>,
    pub removed: Vec<ArtifactInstance>,
}

impl FeedChangedInfo {
    pub fn has_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Best version per quality tier, computed in a single pass applying each
/// version against the running best-per-tier accumulator.
///
/// A tier holds the highest version whose quality is at least the tier
/// level, so a stable release is also the best CI candidate.
#[derive(Debug, Clone, Default)]
pub struct PackageQualityVector {
    ci: Option<Arc<PackageInstance>>,
    exploratory: Option<Arc<PackageInstance>>,
    preview: Option<Arc<PackageInstance>>,
    latest: Option<Arc<PackageInstance>>,
    stable: Option<Arc<PackageInstance>>,
}

impl PackageQualityVector {
    pub fn apply(&mut self, instance: Arc<PackageInstance>) {
        let quality = PackageQuality::of_version(instance.key().version());
        Self::fold(&mut self.ci, &instance);
        if quality >= PackageQuality::Exploratory {
            Self::fold(&mut self.exploratory, &instance);
        }
        if quality >= PackageQuality::Preview {
            Self::fold(&mut self.preview, &instance);
        }
        if quality >= PackageQuality::ReleaseCandidate {
            Self::fold(&mut self.latest, &instance);
        }
        if quality >= PackageQuality::Stable {
            Self::fold(&mut self.stable, &instance);
        }
    }

    fn fold(slot: &mut Option<Arc<PackageInstance>>, candidate: &Arc<PackageInstance>) {
        let better = match slot {
            Some(current) => candidate.key().version() > current.key().version(),
            None => true,
        };
        if better {
            *slot = Some(candidate.clone());
        }
    }

    pub fn ci(&self) -> Option<&Arc<PackageInstance>> {
        self.ci.as_ref()
    }

    pub fn exploratory(&self) -> Option<&Arc<PackageInstance>> {
        self.exploratory.as_ref()
    }

    pub fn preview(&self) -> Option<&Arc<PackageInstance>> {
        self.preview.as_ref()
    }

    pub fn latest(&self) -> Option<&Arc<PackageInstance>> {
        self.latest.as_ref()
    }

    pub fn stable(&self) -> Option<&Arc<PackageInstance>> {
        self.stable.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.ci.is_none()
    }
}

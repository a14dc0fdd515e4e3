use crate::core::artifact::{Artifact, ArtifactInstance};
use crate::core::package::PackageInstance;
use crate::{DepotError, Result};
use std::cmp::Ordering;
use std::sync::Arc;

/// A batched edit against an [`InstanceStore`]. Positions refer to the
/// *original* array: insertion points for a whole batch are computed once
/// against the source store, never against intermediate arrays.
#[derive(Debug, Clone)]
pub(crate) enum StoreEdit {
    /// Insert `instance` before original index `at`.
    Insert {
        at: usize,
        instance: Arc<PackageInstance>,
    },
    /// Replace the existing element at original index `at`.
    Replace {
        at: usize,
        instance: Arc<PackageInstance>,
    },
    /// Remove the existing element at original index `at`.
    Remove { at: usize },
}

impl StoreEdit {
    fn at(&self) -> usize {
        match self {
            StoreEdit::Insert { at, .. }
            | StoreEdit::Replace { at, .. }
            | StoreEdit::Remove { at } => *at,
        }
    }

    // Removals sort before insertions at the same slot.
    fn rank(&self) -> u8 {
        match self {
            StoreEdit::Remove { .. } => 0,
            StoreEdit::Replace { .. } => 1,
            StoreEdit::Insert { .. } => 2,
        }
    }

    fn sort_key(&self) -> Option<&ArtifactInstance> {
        match self {
            StoreEdit::Insert { instance, .. } => Some(instance.key()),
            _ => None,
        }
    }
}

/// The fundamental engine: a single array of [`PackageInstance`] kept
/// strictly sorted by (type, name, version-descending), with binary-search
/// lookups and copy-on-write batched mutation.
///
/// Any mutation returns a new store; prior references stay valid and never
/// observe the change.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    instances: Arc<[Arc<PackageInstance>]>,
}

impl InstanceStore {
    pub fn empty() -> Self {
        Self {
            instances: Arc::from(Vec::new()),
        }
    }

    /// Builds a store from an already strictly ordered sequence. Used by
    /// deserialization; ordering is validated, not assumed.
    pub(crate) fn from_sorted(instances: Vec<Arc<PackageInstance>>) -> Result<Self> {
        for w in instances.windows(2) {
            if w[0].key() >= w[1].key() {
                return Err(DepotError::Corrupt(format!(
                    "instances not strictly ordered: '{}' then '{}'",
                    w[0], w[1]
                )));
            }
        }
        Ok(Self {
            instances: instances.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[Arc<PackageInstance>] {
        &self.instances
    }

    pub fn get(&self, index: usize) -> Option<&Arc<PackageInstance>> {
        self.instances.get(index)
    }

    /// Standard binary-search contract: `Ok(index)` when the key is
    /// present, `Err(insertion_point)` when it is not.
    pub fn index_of(&self, key: &ArtifactInstance) -> std::result::Result<usize, usize> {
        self.instances.binary_search_by(|p| p.key().cmp(key))
    }

    /// Point lookup. Ghost instances are not returned; use
    /// [`InstanceStore::find_with_ghosts`] to see them.
    pub fn find(&self, key: &ArtifactInstance) -> Option<&Arc<PackageInstance>> {
        self.find_with_ghosts(key).filter(|p| !p.is_ghost())
    }

    pub fn find_with_ghosts(&self, key: &ArtifactInstance) -> Option<&Arc<PackageInstance>> {
        self.index_of(key).ok().map(|i| &self.instances[i])
    }

    /// All instances of one artifact type, as a contiguous slice in store
    /// order. Empty slice when the type is absent.
    pub fn instances_of_type(&self, artifact_type: &str) -> &[Arc<PackageInstance>] {
        self.range(
            |p| p.key().artifact_type().cmp(artifact_type),
        )
    }

    /// All versions of one artifact, newest first. Empty slice when absent.
    pub fn instances_of(&self, artifact: &Artifact) -> &[Arc<PackageInstance>] {
        self.range(|p| p.key().artifact().cmp(artifact))
    }

    /// Two-sided binary search: the left bound uses a comparator that never
    /// says `Equal` (an exact match compares `Greater`, pushing the search
    /// left), the right bound maps a match to `Less`. Two O(log n) probes
    /// yield the half-open matching range on the flat sorted array.
    fn range(
        &self,
        cmp: impl Fn(&PackageInstance) -> Ordering,
    ) -> &[Arc<PackageInstance>] {
        let start = self
            .instances
            .binary_search_by(|p| match cmp(p.as_ref()) {
                Ordering::Equal => Ordering::Greater,
                o => o,
            })
            .unwrap_err();
        let end = self
            .instances
            .binary_search_by(|p| match cmp(p.as_ref()) {
                Ordering::Equal => Ordering::Less,
                o => o,
            })
            .unwrap_err();
        if start >= end {
            return &[];
        }
        &self.instances[start..end]
    }

    /// Applies a whole batch of edits in a single linear merge pass into
    /// one new allocation. Edits are sorted by original index (removals
    /// before insertions at the same slot, equal-slot insertions by key)
    /// and spliced while unaffected runs are copied through.
    ///
    /// Passing an insertion for a key that already exists is a caller bug
    /// and panics.
    pub(crate) fn with_edits(&self, mut edits: Vec<StoreEdit>) -> InstanceStore {
        if edits.is_empty() {
            return self.clone();
        }
        edits.sort_by(|a, b| {
            a.at()
                .cmp(&b.at())
                .then_with(|| a.rank().cmp(&b.rank()))
                .then_with(|| a.sort_key().cmp(&b.sort_key()))
        });

        let inserts = edits
            .iter()
            .filter(|e| matches!(e, StoreEdit::Insert { .. }))
            .count();
        let removes = edits
            .iter()
            .filter(|e| matches!(e, StoreEdit::Remove { .. }))
            .count();
        let mut out: Vec<Arc<PackageInstance>> =
            Vec::with_capacity(self.len() + inserts - removes);
        let mut src = 0usize;

        for edit in edits {
            match edit {
                StoreEdit::Remove { at } => {
                    assert!(at >= src && at < self.len(), "remove position out of order");
                    out.extend_from_slice(&self.instances[src..at]);
                    src = at + 1;
                }
                StoreEdit::Replace { at, instance } => {
                    assert!(at >= src && at < self.len(), "replace position out of order");
                    assert!(
                        self.instances[at].key() == instance.key(),
                        "replace must keep the key at its slot"
                    );
                    out.extend_from_slice(&self.instances[src..at]);
                    out.push(instance);
                    src = at + 1;
                }
                StoreEdit::Insert { at, instance } => {
                    assert!(at <= self.len(), "insert position out of order");
                    // A removal at this same original slot has already
                    // advanced `src` past `at`; the insert still lands here.
                    let cut = at.max(src);
                    out.extend_from_slice(&self.instances[src..cut]);
                    src = cut;
                    if let Some(prev) = out.last() {
                        assert!(
                            prev.key() < instance.key(),
                            "insert of already present or misordered key '{}'",
                            instance
                        );
                    }
                    out.push(instance);
                }
            }
        }
        out.extend_from_slice(&self.instances[src..]);

        debug_assert!(
            out.windows(2).all(|w| w[0].key() < w[1].key()),
            "batch edits broke the store ordering"
        );
        InstanceStore {
            instances: out.into(),
        }
    }
}

impl Default for InstanceStore {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::package::PackageState;

    fn pkg(s: &str) -> Arc<PackageInstance> {
        Arc::new(PackageInstance::new(
            s.parse().unwrap(),
            None,
            PackageState::empty(),
            Vec::new(),
        ))
    }

    fn store_of(keys: &[&str]) -> InstanceStore {
        let mut instances: Vec<_> = keys.iter().map(|k| pkg(k)).collect();
        instances.sort_by(|a, b| a.key().cmp(b.key()));
        InstanceStore::from_sorted(instances).unwrap()
    }

    #[test]
    fn ordering_invariant_holds() {
        let s = store_of(&[
            "NuGet:Foo@1.0.0",
            "NuGet:Foo@2.0.0",
            "NuGet:Bar@1.0.0",
            "CKSetup:Zed@0.1.0",
            "NuGet:Foo@1.5.0",
        ]);
        for w in s.instances().windows(2) {
            assert!(w[0].key() < w[1].key());
        }
        // Versions of a name come newest first.
        let foos = s.instances_of(&"NuGet:Foo".parse().unwrap());
        let versions: Vec<String> = foos.iter().map(|p| p.key().version().to_string()).collect();
        assert_eq!(versions, vec!["2.0.0", "1.5.0", "1.0.0"]);
    }

    #[test]
    fn index_of_contract() {
        let s = store_of(&["NuGet:Bar@1.0.0", "NuGet:Foo@1.0.0"]);
        assert_eq!(s.index_of(&"NuGet:Bar@1.0.0".parse().unwrap()), Ok(0));
        assert_eq!(s.index_of(&"NuGet:Foo@1.0.0".parse().unwrap()), Ok(1));
        // Absent key yields its insertion point.
        assert_eq!(s.index_of(&"NuGet:Baz@1.0.0".parse().unwrap()), Err(1));
        assert_eq!(s.index_of(&"Aaa:Aaa@1.0.0".parse().unwrap()), Err(0));
        assert_eq!(s.index_of(&"Zzz:Zzz@1.0.0".parse().unwrap()), Err(2));
    }

    #[test]
    fn range_by_type_and_artifact() {
        let s = store_of(&[
            "CKSetup:Comp@1.0.0",
            "NuGet:Alpha@1.0.0",
            "NuGet:Alpha@0.9.0",
            "NuGet:Beta@3.0.0",
            "Npm:lib@1.0.0",
        ]);
        let nuget = s.instances_of_type("NuGet");
        assert_eq!(nuget.len(), 3);
        assert!(nuget.iter().all(|p| p.key().artifact_type() == "NuGet"));

        assert!(s.instances_of_type("Cargo").is_empty());
        assert!(s
            .instances_of(&"NuGet:Gamma".parse().unwrap())
            .is_empty());

        let alphas = s.instances_of(&"NuGet:Alpha".parse().unwrap());
        assert_eq!(alphas.len(), 2);
        assert_eq!(alphas[0].key().version().to_string(), "1.0.0");
    }

    #[test]
    fn batched_inserts_use_original_positions() {
        let s = store_of(&["NuGet:B@1.0.0", "NuGet:D@1.0.0"]);
        // All insertion points computed against the original array.
        let edits = ["NuGet:A@1.0.0", "NuGet:C@1.0.0", "NuGet:E@1.0.0"]
            .iter()
            .map(|k| {
                let p = pkg(k);
                let at = s.index_of(p.key()).unwrap_err();
                StoreEdit::Insert { at, instance: p }
            })
            .collect();
        let s2 = s.with_edits(edits);
        let names: Vec<&str> = s2.instances().iter().map(|p| p.key().name()).collect();
        assert_eq!(names, vec!["A", "B", "C", "D", "E"]);
        // The original store is unaffected.
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn batched_mixed_edits_single_pass() {
        let s = store_of(&[
            "NuGet:A@1.0.0",
            "NuGet:B@1.0.0",
            "NuGet:C@1.0.0",
            "NuGet:D@1.0.0",
        ]);
        let replacement = Arc::new(PackageInstance::new(
            "NuGet:C@1.0.0".parse().unwrap(),
            None,
            PackageState::UNLISTED,
            Vec::new(),
        ));
        let edits = vec![
            StoreEdit::Remove { at: 1 },
            StoreEdit::Insert {
                at: 1,
                instance: pkg("NuGet:Ba@1.0.0"),
            },
            StoreEdit::Replace {
                at: 2,
                instance: replacement,
            },
            StoreEdit::Insert {
                at: 4,
                instance: pkg("NuGet:E@1.0.0"),
            },
        ];
        let s2 = s.with_edits(edits);
        let names: Vec<&str> = s2.instances().iter().map(|p| p.key().name()).collect();
        assert_eq!(names, vec!["A", "Ba", "C", "D", "E"]);
        assert!(s2
            .find_with_ghosts(&"NuGet:C@1.0.0".parse().unwrap())
            .unwrap()
            .state()
            .contains(PackageState::UNLISTED));
    }

    #[test]
    fn insert_at_a_removed_slot() {
        let s = store_of(&["NuGet:Foo@1.0.0", "NuGet:Zed@1.0.0"]);
        // The newer version sorts before the removed one, so both edits
        // target original slot 0.
        let edits = vec![
            StoreEdit::Remove { at: 0 },
            StoreEdit::Insert {
                at: 0,
                instance: pkg("NuGet:Foo@2.0.0"),
            },
        ];
        let s2 = s.with_edits(edits);
        let keys: Vec<String> = s2.instances().iter().map(|p| p.key().to_string()).collect();
        assert_eq!(keys, vec!["NuGet:Foo@2.0.0", "NuGet:Zed@1.0.0"]);
    }

    #[test]
    #[should_panic(expected = "already present or misordered")]
    fn inserting_existing_key_panics() {
        let s = store_of(&["NuGet:A@1.0.0"]);
        // index 1 is "after the existing A", a position a buggy caller
        // would compute by not checking Ok() from index_of.
        s.with_edits(vec![StoreEdit::Insert {
            at: 1,
            instance: pkg("NuGet:A@1.0.0"),
        }]);
    }

    #[test]
    fn ghost_hidden_from_find() {
        let ghost = Arc::new(PackageInstance::new(
            "NuGet:G@1.0.0".parse().unwrap(),
            None,
            PackageState::GHOST,
            Vec::new(),
        ));
        let s = InstanceStore::from_sorted(vec![ghost]).unwrap();
        let key: ArtifactInstance = "NuGet:G@1.0.0".parse().unwrap();
        assert!(s.find(&key).is_none());
        assert!(s.find_with_ghosts(&key).is_some());
    }
}

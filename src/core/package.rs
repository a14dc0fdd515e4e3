use crate::core::artifact::ArtifactInstance;
use bitflags::bitflags;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// An optional trait set categorizing build variants of a package (for
/// example target frameworks). When present it is never empty; all savor
/// sets that interact belong to the same named context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SavorSet {
    context: String,
    traits: BTreeSet<String>,
}

impl SavorSet {
    /// Returns `None` when `traits` is empty: an empty savor set carries no
    /// information and is represented as the absence of savors.
    pub fn new(context: impl Into<String>, traits: impl IntoIterator<Item = String>) -> Option<Self> {
        let traits: BTreeSet<String> = traits.into_iter().collect();
        if traits.is_empty() {
            return None;
        }
        Some(Self {
            context: context.into(),
            traits,
        })
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn traits(&self) -> &BTreeSet<String> {
        &self.traits
    }

    pub fn is_subset_of(&self, other: &SavorSet) -> bool {
        self.context == other.context && self.traits.is_subset(&other.traits)
    }

    /// Canonical `|`-joined trait list (sorted).
    pub fn traits_text(&self) -> String {
        self.traits.iter().cloned().collect::<Vec<_>>().join("|")
    }

    pub(crate) fn from_traits_text(context: &str, text: &str) -> Option<Self> {
        Self::new(context, text.split('|').map(str::to_string))
    }
}

impl fmt::Display for SavorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.context, self.traits_text())
    }
}

bitflags! {
    /// Package state flags, mutable by replacement only.
    ///
    /// A `GHOST` package is present for dependency-graph integrity but is
    /// excluded from point lookups unless explicitly requested.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PackageState: u8 {
        const UNLISTED = 0b0000_0001;
        const DEPRECATED = 0b0000_0010;
        const GHOST = 0b0000_0100;
    }
}

impl PackageState {
    pub fn is_ghost(self) -> bool {
        self.contains(PackageState::GHOST)
    }

    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut state = PackageState::empty();
        for n in names {
            match n {
                "Unlisted" => state |= PackageState::UNLISTED,
                "Deprecated" => state |= PackageState::DEPRECATED,
                "Ghost" => state |= PackageState::GHOST,
                _ => return None,
            }
        }
        Some(state)
    }
}

/// Release quality derived from a version's prerelease tag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum PackageQuality {
    #[serde(rename = "CI")]
    CI = 0,
    Exploratory = 1,
    Preview = 2,
    ReleaseCandidate = 3,
    Stable = 4,
}

impl PackageQuality {
    pub fn of_version(v: &Version) -> PackageQuality {
        if v.pre.is_empty() {
            return PackageQuality::Stable;
        }
        let tag = v.pre.as_str();
        let first = tag.split(['.', '-']).next().unwrap_or(tag);
        let lower = first.to_ascii_lowercase();
        match lower.as_str() {
            "rc" => PackageQuality::ReleaseCandidate,
            "pre" | "prerelease" | "preview" | "beta" | "b" => PackageQuality::Preview,
            "alpha" | "a" | "exp" | "exploratory" => PackageQuality::Exploratory,
            _ => PackageQuality::CI,
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PackageQuality::CI),
            1 => Some(PackageQuality::Exploratory),
            2 => Some(PackageQuality::Preview),
            3 => Some(PackageQuality::ReleaseCandidate),
            4 => Some(PackageQuality::Stable),
            _ => None,
        }
    }
}

/// How strictly a dependency pins its target version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum VersionLock {
    None = 0,
    LockMajor = 1,
    LockMinor = 2,
    LockPatch = 3,
    Lock = 4,
}

impl VersionLock {
    pub(crate) fn to_byte(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(VersionLock::None),
            1 => Some(VersionLock::LockMajor),
            2 => Some(VersionLock::LockMinor),
            3 => Some(VersionLock::LockPatch),
            4 => Some(VersionLock::Lock),
            _ => None,
        }
    }
}

/// Kind of a dependency edge. `None` is invalid on an actual reference and
/// is rejected during registration.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum DependencyKind {
    None = 0,
    Transitive = 1,
    Development = 2,
    Private = 3,
}

impl DependencyKind {
    pub(crate) fn to_byte(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(DependencyKind::None),
            1 => Some(DependencyKind::Transitive),
            2 => Some(DependencyKind::Development),
            3 => Some(DependencyKind::Private),
            _ => None,
        }
    }
}

/// A dependency edge owned by a [`PackageInstance`], pointing at the lowest
/// satisfying instance of the target package.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    base_target: ArtifactInstance,
    lock: VersionLock,
    min_quality: PackageQuality,
    kind: DependencyKind,
    applicable_savors: Option<SavorSet>,
}

impl Reference {
    pub(crate) fn new(
        base_target: ArtifactInstance,
        lock: VersionLock,
        min_quality: PackageQuality,
        kind: DependencyKind,
        applicable_savors: Option<SavorSet>,
    ) -> Self {
        Self {
            base_target,
            lock,
            min_quality,
            kind,
            applicable_savors,
        }
    }

    /// The lowest instance that satisfies this reference.
    pub fn base_target(&self) -> &ArtifactInstance {
        &self.base_target
    }

    pub fn lock(&self) -> VersionLock {
        self.lock
    }

    pub fn min_quality(&self) -> PackageQuality {
        self.min_quality
    }

    pub fn kind(&self) -> DependencyKind {
        self.kind
    }

    /// Subset of the owner's savors this dependency applies to. `None`
    /// means the dependency applies to every savor of the owner.
    pub fn applicable_savors(&self) -> Option<&SavorSet> {
        self.applicable_savors.as_ref()
    }

    /// Whether `candidate` falls in the effective version range derived
    /// from (base version, lock, minimal quality).
    pub fn satisfies(&self, candidate: &Version) -> bool {
        let base = self.base_target.version();
        if candidate < base {
            return false;
        }
        if PackageQuality::of_version(candidate) < self.min_quality {
            return false;
        }
        match self.lock {
            VersionLock::None => true,
            VersionLock::LockMajor => candidate.major == base.major,
            VersionLock::LockMinor => {
                candidate.major == base.major && candidate.minor == base.minor
            }
            VersionLock::LockPatch => {
                candidate.major == base.major
                    && candidate.minor == base.minor
                    && candidate.patch == base.patch
            }
            VersionLock::Lock => candidate == base,
        }
    }
}

/// An immutable package node: identity, optional savor set, state flags and
/// ordered dependency list. Instances are created only by the database.
///
/// Equality, hashing and ordering derive solely from the key.
#[derive(Debug, Clone)]
pub struct PackageInstance {
    key: ArtifactInstance,
    savors: Option<SavorSet>,
    state: PackageState,
    dependencies: Vec<Reference>,
}

impl PackageInstance {
    pub(crate) fn new(
        key: ArtifactInstance,
        savors: Option<SavorSet>,
        state: PackageState,
        dependencies: Vec<Reference>,
    ) -> Self {
        Self {
            key,
            savors,
            state,
            dependencies,
        }
    }

    pub fn key(&self) -> &ArtifactInstance {
        &self.key
    }

    pub fn savors(&self) -> Option<&SavorSet> {
        self.savors.as_ref()
    }

    pub fn state(&self) -> PackageState {
        self.state
    }

    pub fn is_ghost(&self) -> bool {
        self.state.is_ghost()
    }

    pub fn dependencies(&self) -> &[Reference] {
        &self.dependencies
    }

    /// Deep content equality: savors and canonicalized dependency list.
    /// State and key are not part of the content.
    pub fn same_content(&self, other: &PackageInstance) -> bool {
        self.savors == other.savors && self.dependencies == other.dependencies
    }
}

impl PartialEq for PackageInstance {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for PackageInstance {}

impl std::hash::Hash for PackageInstance {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for PackageInstance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageInstance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for PackageInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

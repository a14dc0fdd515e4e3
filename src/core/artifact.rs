use crate::{DepotError, Result};
use semver::Version;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Identity of a package family: (type, name).
///
/// The textual form is `Type:Name`, e.g. `NuGet:Newtonsoft.Json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Artifact {
    artifact_type: String,
    name: String,
}

impl Artifact {
    pub fn new(artifact_type: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let artifact_type = artifact_type.into();
        let name = name.into();
        if !is_valid_part(&artifact_type) {
            return Err(DepotError::InvalidArtifact(format!(
                "invalid artifact type '{}'",
                artifact_type
            )));
        }
        if !is_valid_part(&name) {
            return Err(DepotError::InvalidArtifact(format!(
                "invalid artifact name '{}'",
                name
            )));
        }
        Ok(Self {
            artifact_type,
            name,
        })
    }

    pub fn artifact_type(&self) -> &str {
        &self.artifact_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `Type:Name` form.
    pub fn typed_name(&self) -> String {
        format!("{}:{}", self.artifact_type, self.name)
    }

    pub fn with_version(&self, version: Version) -> ArtifactInstance {
        ArtifactInstance {
            artifact: self.clone(),
            version,
        }
    }
}

/// Artifact type and name segments: non-empty, alphanumeric plus `.`, `_`, `-`.
pub(crate) fn is_valid_part(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.artifact_type, self.name)
    }
}

impl FromStr for Artifact {
    type Err = DepotError;

    fn from_str(s: &str) -> Result<Self> {
        let (t, n) = s
            .split_once(':')
            .ok_or_else(|| DepotError::InvalidArtifact(format!("missing ':' in '{}'", s)))?;
        Artifact::new(t, n)
    }
}

impl PartialOrd for Artifact {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Artifact {
    fn cmp(&self, other: &Self) -> Ordering {
        self.artifact_type
            .cmp(&other.artifact_type)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// One concrete version of an [`Artifact`].
///
/// Textual form is `Type:Name@Version`, e.g. `NuGet:Foo@1.0.0`.
///
/// Total ordering is by type, then name, then version *descending* (newest
/// first) - the ordering every binary search in the store relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactInstance {
    artifact: Artifact,
    version: Version,
}

impl ArtifactInstance {
    pub fn new(artifact: Artifact, version: Version) -> Self {
        Self { artifact, version }
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn artifact_type(&self) -> &str {
        self.artifact.artifact_type()
    }

    pub fn name(&self) -> &str {
        self.artifact.name()
    }

    pub fn version(&self) -> &Version {
        &self.version
    }
}

impl fmt::Display for ArtifactInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.artifact, self.version)
    }
}

impl FromStr for ArtifactInstance {
    type Err = DepotError;

    fn from_str(s: &str) -> Result<Self> {
        let (id, v) = s
            .rsplit_once('@')
            .ok_or_else(|| DepotError::InvalidArtifact(format!("missing '@' in '{}'", s)))?;
        let artifact: Artifact = id.parse()?;
        let version = Version::parse(v)?;
        Ok(Self { artifact, version })
    }
}

impl PartialOrd for ArtifactInstance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArtifactInstance {
    fn cmp(&self, other: &Self) -> Ordering {
        // Version descending: newest versions sort first within a name.
        self.artifact
            .cmp(&other.artifact)
            .then_with(|| other.version.cmp(&self.version))
    }
}

impl Serialize for Artifact {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Artifact {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl Serialize for ArtifactInstance {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtifactInstance {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(s: &str) -> ArtifactInstance {
        s.parse().unwrap()
    }

    #[test]
    fn parse_and_display_round_trip() {
        let a = inst("NuGet:Newtonsoft.Json@13.0.1");
        assert_eq!(a.artifact_type(), "NuGet");
        assert_eq!(a.name(), "Newtonsoft.Json");
        assert_eq!(a.version().to_string(), "13.0.1");
        assert_eq!(a.to_string(), "NuGet:Newtonsoft.Json@13.0.1");
    }

    #[test]
    fn rejects_malformed_identities() {
        assert!("NuGetFoo".parse::<Artifact>().is_err());
        assert!(":Foo".parse::<Artifact>().is_err());
        assert!("NuGet:".parse::<Artifact>().is_err());
        assert!("Nu Get:Foo".parse::<Artifact>().is_err());
        assert!("NuGet:Foo".parse::<ArtifactInstance>().is_err());
        assert!("NuGet:Foo@not-a-version".parse::<ArtifactInstance>().is_err());
    }

    #[test]
    fn version_sorts_descending_within_a_name() {
        let newer = inst("NuGet:Foo@2.0.0");
        let older = inst("NuGet:Foo@1.0.0");
        assert!(newer < older);

        let pre = inst("NuGet:Foo@2.0.0-alpha");
        assert!(newer < pre);
        assert!(pre < older);
    }

    #[test]
    fn type_then_name_sort_ascending() {
        let a = inst("CKSetup:Zeta@1.0.0");
        let b = inst("NuGet:Alpha@1.0.0");
        let c = inst("NuGet:Beta@9.0.0");
        assert!(a < b);
        assert!(b < c);
    }
}

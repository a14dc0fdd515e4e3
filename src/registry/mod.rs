//! External package feed collaborators
//!
//! A feed is a named source of packages of one artifact type. The live
//! cache queries feeds on a miss; everything behind [`FeedSource`] is
//! outside the cache engine.

pub mod client;
pub mod http_feed;

use crate::core::artifact::ArtifactInstance;
use crate::core::database::DependencyInfo;
use crate::core::package::SavorSet;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a feed knows about one package: identity, savors and declared
/// dependencies. Feed membership is recorded by the live layer, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePackageInfo {
    pub key: ArtifactInstance,
    #[serde(default)]
    pub savors: Option<SavorSet>,
    #[serde(default)]
    pub dependencies: Vec<DependencyInfo>,
}

/// A typed, named external package feed.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// The single artifact type this feed carries.
    fn artifact_type(&self) -> &str;

    fn name(&self) -> &str;

    fn typed_name(&self) -> String {
        format!("{}:{}", self.artifact_type(), self.name())
    }

    /// Fetches one package's info.
    ///
    /// `Ok(None)` is a positive "this feed does not have the package". Any
    /// error is a feed access failure and never means not-found.
    async fn get_package_info(
        &self,
        instance: &ArtifactInstance,
    ) -> Result<Option<RemotePackageInfo>>;
}

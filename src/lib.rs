//! Depot - in-process artifact package cache
//!
//! An immutable, versioned database of build-artifact packages keyed by
//! (type, name, version), together with their inter-package dependencies,
//! plus a live layer that fills cache misses by querying external package
//! feeds, deduplicating concurrent identical fetches and recursively
//! resolving transitive dependency closures before committing them
//! atomically.

pub mod core;
pub mod registry;

// Re-export commonly used types
pub use crate::core::{
    artifact::{Artifact, ArtifactInstance},
    cache::PackageCache,
    database::{
        ChangedInfo, DependencyInfo, FullPackageInfo, PackageChangedInfo, PackageDatabase,
        PackageEventType,
    },
    feed::{FeedChangedInfo, PackageFeed, PackageQualityVector},
    live::LivePackageCache,
    package::{
        DependencyKind, PackageInstance, PackageQuality, PackageState, Reference, SavorSet,
        VersionLock,
    },
    store::InstanceStore,
};

pub use crate::registry::{
    client::build_http_client, http_feed::HttpFeed, FeedSource, RemotePackageInfo,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DepotError {
    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("Invalid package info for {key}: {reason}")]
    InvalidPackageInfo { key: String, reason: String },

    #[error("Missing dependencies: {}", format_instances(.0))]
    MissingDependencies(Vec<ArtifactInstance>),

    #[error("Package not found: {0}")]
    PackageNotFound(ArtifactInstance),

    #[error("Feed access failed for {key}: {}", .reasons.join("; "))]
    FeedAccess {
        key: ArtifactInstance,
        reasons: Vec<String>,
    },

    #[error("Feeds '{first_feed}' and '{second_feed}' returned different content for {key}")]
    CrossFeedInconsistency {
        key: ArtifactInstance,
        first_feed: String,
        second_feed: String,
    },

    /// An error produced by a deduplicated in-flight resolution; every
    /// caller sharing the request observes the same underlying failure.
    #[error("{0}")]
    Shared(std::sync::Arc<DepotError>),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt database stream: {0}")]
    Corrupt(String),

    #[error("Version error: {0}")]
    Version(#[from] semver::Error),
}

fn format_instances(instances: &[ArtifactInstance]) -> String {
    instances
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, DepotError>;

/// Global constants for tuning
pub mod constants {
    use std::time::Duration;

    pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
    pub const POOL_MAX_IDLE_PER_HOST: usize = 32;
    pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const TCP_KEEPALIVE: Duration = Duration::from_secs(60);
    /// Capacity of the change-event broadcast channel.
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
}

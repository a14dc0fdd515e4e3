use crate::core::artifact::ArtifactInstance;
use crate::core::cache::PackageCache;
use crate::core::database::FullPackageInfo;
use crate::core::package::{PackageInstance, PackageState};
use crate::registry::{FeedSource, RemotePackageInfo};
use crate::{DepotError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one per-instance resolution, clonable so concurrent callers
/// can share a single in-flight request.
type PendingResult = std::result::Result<Option<Arc<FullPackageInfo>>, Arc<DepotError>>;
type PendingFuture = Shared<BoxFuture<'static, PendingResult>>;

/// Async layer over a [`PackageCache`]: on a miss it resolves the
/// requested package and its whole dependency closure from a configured
/// set of external feeds, then commits the closure as one atomic `add`.
///
/// Concurrent identical requests share one in-flight resolution (stampede
/// protection); closure commits are serialized by a dedicated lock so two
/// concurrent closures never interleave their writes.
pub struct LivePackageCache {
    inner: Arc<Inner>,
}

struct Inner {
    cache: Arc<PackageCache>,
    feeds: Vec<Arc<dyn FeedSource>>,
    pending: Mutex<FxHashMap<ArtifactInstance, PendingFuture>>,
    commit_lock: tokio::sync::Mutex<()>,
}

impl LivePackageCache {
    pub fn new(cache: Arc<PackageCache>, feeds: Vec<Arc<dyn FeedSource>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                feeds,
                pending: Mutex::new(FxHashMap::default()),
                commit_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<PackageCache> {
        &self.inner.cache
    }

    /// Returns the cached instance, resolving it (and its full dependency
    /// closure) from the feeds first when it is not cached yet.
    ///
    /// `Ok(None)` means no feed has the package and no feed failed: a
    /// genuine not-found. If a feed failed and none returned the package,
    /// the situation is ambiguous and the errors surface instead.
    pub async fn ensure(
        &self,
        instance: &ArtifactInstance,
    ) -> Result<Option<Arc<PackageInstance>>> {
        if let Some(p) = self.inner.cache.db().find_with_ghosts(instance) {
            return Ok(Some(p.clone()));
        }

        let mut closure: Vec<Arc<FullPackageInfo>> = Vec::new();
        let mut touched: HashSet<ArtifactInstance> = HashSet::new();
        let result = self.drive(instance, &mut closure, &mut touched).await;

        // Completed resolutions are dropped from the pending map on success
        // and on failure alike: their outcome is either committed already
        // or must be retried fresh. Only still-running futures stay.
        self.inner
            .pending
            .lock()
            .retain(|_, f| f.peek().is_none());
        result
    }

    async fn drive(
        &self,
        instance: &ArtifactInstance,
        closure: &mut Vec<Arc<FullPackageInfo>>,
        touched: &mut HashSet<ArtifactInstance>,
    ) -> Result<Option<Arc<PackageInstance>>> {
        let root = resolve(&self.inner, instance.clone())
            .await
            .map_err(DepotError::Shared)?;
        if root.is_none() {
            debug!(package = %instance, "not present in any feed");
            return Ok(None);
        }
        collect(&self.inner, instance.clone(), closure, touched)
            .await
            .map_err(DepotError::Shared)?;

        if !closure.is_empty() {
            let infos: Vec<FullPackageInfo> = closure.iter().map(|i| (**i).clone()).collect();
            // Whole-closure commits never interleave.
            let _commit = self.inner.commit_lock.lock().await;
            self.inner.cache.add(&infos)?;
            debug!(package = %instance, closure = infos.len(), "closure committed");
        }
        Ok(self.inner.cache.db().find_with_ghosts(instance).cloned())
    }
}

/// Registers (or joins) the pending resolution for `key`. The shared
/// future is created under the pending lock so two concurrent requests for
/// the same key always observe each other.
fn resolve(inner: &Arc<Inner>, key: ArtifactInstance) -> PendingFuture {
    let mut pending = inner.pending.lock();
    if let Some(f) = pending.get(&key) {
        return f.clone();
    }
    let fut = fetch(inner.clone(), key.clone()).boxed().shared();
    pending.insert(key, fut.clone());
    fut
}

/// Queries every feed of the matching artifact type in sequence, merging
/// and cross-checking the responses. Dependencies are not followed here;
/// the closure walk in [`collect`] drives them through the same pending
/// map, so a dependency cycle terminates there instead of deadlocking two
/// shared futures on each other.
async fn fetch(inner: Arc<Inner>, key: ArtifactInstance) -> PendingResult {
    let mut found: Option<(RemotePackageInfo, String)> = None;
    let mut feed_names: Vec<String> = Vec::new();
    let mut failures: Vec<String> = Vec::new();

    for feed in inner
        .feeds
        .iter()
        .filter(|f| f.artifact_type() == key.artifact_type())
    {
        match feed.get_package_info(&key).await {
            Ok(Some(info)) => {
                match &found {
                    Some((first, first_feed)) => {
                        // Two feeds disagreeing on the same identity is a
                        // fatal inconsistency, never "first wins".
                        if *first != info {
                            return Err(Arc::new(DepotError::CrossFeedInconsistency {
                                key,
                                first_feed: first_feed.clone(),
                                second_feed: feed.name().to_string(),
                            }));
                        }
                    }
                    None => found = Some((info, feed.name().to_string())),
                }
                feed_names.push(feed.name().to_string());
            }
            Ok(None) => {}
            Err(e) => {
                warn!(package = %key, feed = %feed.typed_name(), error = %e, "feed access failed");
                failures.push(format!("{}: {}", feed.typed_name(), e));
            }
        }
    }

    let Some((info, _)) = found else {
        if failures.is_empty() {
            // Every feed was queried and none has it.
            return Ok(None);
        }
        // The package might exist behind the failing feed: ambiguous.
        return Err(Arc::new(DepotError::FeedAccess {
            key,
            reasons: failures,
        }));
    };

    // Feed membership is exhaustively known only if every matching feed
    // answered.
    let all_feed_names_are_known = failures.is_empty();

    Ok(Some(Arc::new(FullPackageInfo {
        key: info.key,
        savors: info.savors,
        state: PackageState::empty(),
        dependencies: info.dependencies,
        feed_names,
        all_feed_names_are_known,
    })))
}

/// Post-order walk over the resolved infos: a package is appended only
/// after all of its dependencies, so the closure list satisfies the
/// database's dependencies-first registration order by construction.
fn collect<'a>(
    inner: &'a Arc<Inner>,
    key: ArtifactInstance,
    out: &'a mut Vec<Arc<FullPackageInfo>>,
    touched: &'a mut HashSet<ArtifactInstance>,
) -> BoxFuture<'a, std::result::Result<(), Arc<DepotError>>> {
    async move {
        if inner.cache.db().find_with_ghosts(&key).is_some() {
            return Ok(());
        }
        if !touched.insert(key.clone()) {
            return Ok(());
        }
        let info = resolve(inner, key.clone())
            .await?
            .ok_or_else(|| Arc::new(DepotError::PackageNotFound(key)))?;
        for dep in &info.dependencies {
            collect(inner, dep.target.clone(), out, touched).await?;
        }
        out.push(info);
        Ok(())
    }
    .boxed()
}

//! Binary persistence round-trips for whole databases.

use depot::{
    DependencyInfo, DependencyKind, FullPackageInfo, PackageCache, PackageDatabase,
    PackageQuality, PackageState, SavorSet, VersionLock,
};
use std::sync::Arc;

fn dep(target: &str) -> DependencyInfo {
    DependencyInfo {
        target: target.parse().unwrap(),
        lock: VersionLock::LockMinor,
        min_quality: PackageQuality::Stable,
        kind: DependencyKind::Transitive,
        savors: None,
    }
}

/// Ten "ZZZ" core packages plus fifty "AAA" packages depending on them.
/// "AAA" sorts before "ZZZ" in the store, so every dependency reference
/// serializes as a forward index.
fn build_database() -> Arc<PackageDatabase> {
    let mut batch = Vec::new();
    for i in 0..10 {
        let mut core = FullPackageInfo::new(format!("ZZZ:Core{i}@1.0.0").parse().unwrap());
        core.feed_names = vec!["stable".into()];
        core.all_feed_names_are_known = true;
        if i == 3 {
            core.state = PackageState::GHOST;
        }
        batch.push(core);
    }
    for i in 0..50 {
        let mut pkg =
            FullPackageInfo::new(format!("AAA:Pkg{i:02}@1.{i}.0").parse().unwrap());
        pkg.dependencies = vec![dep(&format!("ZZZ:Core{}@1.0.0", i % 10))];
        pkg.feed_names = vec!["main".into()];
        if i % 7 == 0 {
            pkg.feed_names.push("mirror".into());
        }
        pkg.all_feed_names_are_known = true;
        if i % 9 == 0 {
            pkg.state = PackageState::DEPRECATED;
        }
        if i % 4 == 0 {
            let savors =
                SavorSet::new("tfm", vec!["net6.0".into(), "net8.0".into()]).unwrap();
            pkg.savors = Some(savors);
            if i % 8 == 0 {
                pkg.dependencies[0].savors = SavorSet::new("tfm", vec!["net6.0".into()]);
            }
        }
        batch.push(pkg);
    }
    PackageDatabase::empty().add(&batch).unwrap().db
}

fn assert_same_database(a: &PackageDatabase, b: &PackageDatabase) {
    assert_eq!(a.instances().len(), b.instances().len());
    for (x, y) in a.instances().instances().iter().zip(b.instances().instances()) {
        assert_eq!(x.key(), y.key());
        assert_eq!(x.state(), y.state());
        assert_eq!(x.savors(), y.savors());
        assert_eq!(x.dependencies().len(), y.dependencies().len());
        for (dx, dy) in x.dependencies().iter().zip(y.dependencies()) {
            assert_eq!(dx.base_target(), dy.base_target());
            assert_eq!(dx.lock(), dy.lock());
            assert_eq!(dx.min_quality(), dy.min_quality());
            assert_eq!(dx.kind(), dy.kind());
            assert_eq!(dx.applicable_savors(), dy.applicable_savors());
        }
    }
    assert_eq!(a.feed_count(), b.feed_count());
    for feed in a.feeds() {
        let other = b
            .find_feed(&feed.typed_name())
            .unwrap_or_else(|| panic!("feed {} lost", feed.typed_name()));
        assert_eq!(feed.len(), other.len());
        for p in feed.instances().instances() {
            assert!(other.contains(p.key()), "{} lost {}", feed.typed_name(), p);
        }
    }
    assert_eq!(
        a.last_update().timestamp_millis(),
        b.last_update().timestamp_millis()
    );
}

#[test]
fn single_package_round_trips() {
    let mut foo = FullPackageInfo::new("NuGet:Foo@1.0.0".parse().unwrap());
    foo.feed_names = vec!["nuget.org".into()];
    foo.all_feed_names_are_known = true;
    let db = PackageDatabase::empty().add(&[foo]).unwrap().db;

    let mut buf = Vec::new();
    db.write(&mut buf).unwrap();
    let back = PackageDatabase::read(&mut buf.as_slice()).unwrap();
    assert_same_database(&db, &back);
}

#[test]
fn graph_with_forward_references_round_trips() {
    let db = build_database();
    assert_eq!(db.instances().len(), 60);

    let mut buf = Vec::new();
    db.write(&mut buf).unwrap();
    let back = PackageDatabase::read(&mut buf.as_slice()).unwrap();
    assert_same_database(&db, &back);

    // The write of a reread database is byte-identical.
    let mut buf2 = Vec::new();
    back.write(&mut buf2).unwrap();
    assert_eq!(buf, buf2);
}

#[test]
fn ghost_state_survives_round_trip() {
    let db = build_database();
    let mut buf = Vec::new();
    db.write(&mut buf).unwrap();
    let back = PackageDatabase::read(&mut buf.as_slice()).unwrap();

    let ghost_key = "ZZZ:Core3@1.0.0".parse().unwrap();
    assert!(back.find(&ghost_key).is_none());
    assert!(back.find_with_ghosts(&ghost_key).unwrap().is_ghost());
}

#[test]
fn cache_file_round_trip() {
    let db = build_database();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("packages.db");

    let cache = PackageCache::new();
    let mut buf = Vec::new();
    db.write(&mut buf).unwrap();
    cache.read(&mut buf.as_slice()).unwrap();
    cache.save_file(&path).unwrap();

    let reloaded = PackageCache::new();
    reloaded.load_file(&path).unwrap();
    assert_eq!(reloaded.db().instances().len(), 60);
    assert_same_database(&db, &reloaded.db());
}

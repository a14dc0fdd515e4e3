//! Bit-exact binary persistence of a [`PackageDatabase`].
//!
//! The stream is a whole-file format: a format version, the instance array
//! in store order with delta-encoded identities and pooled savor sets, the
//! feeds as index lists into the instance array, and the last-update
//! timestamp. Dependency targets are written as absolute array indices and
//! may point forward; the reader materializes all raw records first and
//! resolves indices once every key is known.

use crate::core::artifact::{Artifact, ArtifactInstance};
use crate::core::database::PackageDatabase;
use crate::core::feed::PackageFeed;
use crate::core::package::{
    DependencyKind, PackageInstance, PackageQuality, PackageState, Reference, SavorSet,
    VersionLock,
};
use crate::core::store::InstanceStore;
use crate::{DepotError, Result};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use semver::Version;
use std::io::{Read, Write};
use std::sync::Arc;

/// Current stream format. Version 0 omitted the per-instance state byte
/// and is still readable.
const FORMAT_VERSION: u64 = 1;

/// Refuse absurd string lengths from corrupt streams.
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

/// Element counts read from the stream are only trusted up to this many
/// entries for preallocation; larger claims grow as they actually parse,
/// so a corrupt count fails on the first short read instead of aborting
/// on an absurd allocation.
const MAX_PREALLOC: usize = 1024;

// Identity tag bytes: how much of (type, name) changed vs the previous
// instance in store order.
const TAG_SAME_TYPE_AND_NAME: u8 = 0;
const TAG_NEW_NAME: u8 = 1;
const TAG_NEW_TYPE: u8 = 2;

impl PackageDatabase {
    /// Serializes the whole database. `read` round-trips the result
    /// exactly.
    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut w = Writer::new(out);
        w.varint(FORMAT_VERSION)?;
        let instances = self.instances().instances();
        w.i32(instances.len() as i32)?;

        let mut prev: Option<&ArtifactInstance> = None;
        for p in instances {
            self.write_instance(&mut w, p, prev)?;
            prev = Some(p.key());
        }

        // Feeds in typed-name order so the stream is deterministic.
        let mut feeds: Vec<&PackageFeed> = self.feeds().collect();
        feeds.sort_by_key(|f| f.typed_name());
        w.varint(feeds.len() as u64)?;
        for feed in feeds {
            w.shared_string(feed.artifact_type())?;
            w.string(feed.name())?;
            w.i32(feed.len() as i32)?;
            for p in feed.instances().instances() {
                let index = self
                    .instances()
                    .index_of(p.key())
                    .expect("feed instance present in the global store");
                w.i32(index as i32)?;
            }
        }

        w.i64(self.last_update().timestamp_millis())?;
        Ok(())
    }

    fn write_instance<W: Write>(
        &self,
        w: &mut Writer<'_, W>,
        p: &PackageInstance,
        prev: Option<&ArtifactInstance>,
    ) -> Result<()> {
        let key = p.key();
        match prev {
            Some(prev) if prev.artifact() == key.artifact() => {
                w.u8(TAG_SAME_TYPE_AND_NAME)?;
            }
            Some(prev) if prev.artifact_type() == key.artifact_type() => {
                w.u8(TAG_NEW_NAME)?;
                w.string(key.name())?;
            }
            _ => {
                w.u8(TAG_NEW_TYPE)?;
                w.shared_string(key.artifact_type())?;
                w.string(key.name())?;
            }
        }
        w.string(&key.version().to_string())?;
        w.savors(p.savors())?;
        w.u8(p.state().bits())?;
        w.varint(p.dependencies().len() as u64)?;
        for d in p.dependencies() {
            if p.savors().is_some() {
                // Applicable savors reuse the owner's trait context; the
                // empty string stands for "applies to every savor".
                match d.applicable_savors() {
                    Some(s) => w.string(&s.traits_text())?,
                    None => w.string("")?,
                }
            }
            w.u8(d.lock().to_byte())?;
            w.u8(d.min_quality().to_byte())?;
            w.u8(d.kind().to_byte())?;
            let index = self
                .instances()
                .index_of(d.base_target())
                .expect("dependency target present in the global store");
            w.i32(index as i32)?;
        }
        Ok(())
    }

    /// Reads a database previously produced by [`PackageDatabase::write`].
    pub fn read<R: Read>(input: &mut R) -> Result<Arc<PackageDatabase>> {
        let mut r = Reader::new(input);
        let version = r.varint()?;
        if version > FORMAT_VERSION {
            return Err(DepotError::Corrupt(format!(
                "unknown format version {}",
                version
            )));
        }
        let count = r.i32()?;
        if count < 0 {
            return Err(DepotError::Corrupt("negative instance count".into()));
        }
        let count = count as usize;

        // Phase one: raw records. Dependency targets are bare indices that
        // may point forward, so references are resolved only after every
        // key has been materialized.
        struct RawDep {
            savors_text: Option<String>,
            lock: VersionLock,
            min_quality: PackageQuality,
            kind: DependencyKind,
            target: usize,
        }
        struct RawInstance {
            key: ArtifactInstance,
            savors: Option<SavorSet>,
            state: PackageState,
            deps: Vec<RawDep>,
        }

        let mut raw: Vec<RawInstance> = Vec::with_capacity(count.min(MAX_PREALLOC));
        let mut prev: Option<Artifact> = None;
        for _ in 0..count {
            let tag = r.u8()?;
            let artifact = match (tag, &prev) {
                (TAG_SAME_TYPE_AND_NAME, Some(a)) => a.clone(),
                (TAG_NEW_NAME, Some(a)) => {
                    let name = r.string()?;
                    Artifact::new(a.artifact_type(), name)
                        .map_err(|e| DepotError::Corrupt(e.to_string()))?
                }
                (TAG_NEW_TYPE, _) => {
                    let t = r.shared_string()?;
                    let name = r.string()?;
                    Artifact::new(t, name).map_err(|e| DepotError::Corrupt(e.to_string()))?
                }
                _ => {
                    return Err(DepotError::Corrupt(format!(
                        "invalid identity tag {}",
                        tag
                    )))
                }
            };
            prev = Some(artifact.clone());
            let version_text = r.string()?;
            let v = Version::parse(&version_text)
                .map_err(|e| DepotError::Corrupt(format!("bad version '{version_text}': {e}")))?;
            let key = artifact.with_version(v);

            let savors = r.savors()?;
            let state = if version >= 1 {
                PackageState::from_bits(r.u8()?)
                    .ok_or_else(|| DepotError::Corrupt("invalid state byte".into()))?
            } else {
                PackageState::empty()
            };

            let dep_count = r.varint()? as usize;
            let mut deps = Vec::with_capacity(dep_count.min(MAX_PREALLOC));
            for _ in 0..dep_count {
                let savors_text = if savors.is_some() {
                    let text = r.string()?;
                    (!text.is_empty()).then_some(text)
                } else {
                    None
                };
                let lock = VersionLock::from_byte(r.u8()?)
                    .ok_or_else(|| DepotError::Corrupt("invalid lock byte".into()))?;
                let min_quality = PackageQuality::from_byte(r.u8()?)
                    .ok_or_else(|| DepotError::Corrupt("invalid quality byte".into()))?;
                let kind = DependencyKind::from_byte(r.u8()?)
                    .ok_or_else(|| DepotError::Corrupt("invalid dependency kind byte".into()))?;
                let target = r.i32()?;
                if target < 0 || target as usize >= count {
                    return Err(DepotError::Corrupt(format!(
                        "dependency index {} out of range",
                        target
                    )));
                }
                deps.push(RawDep {
                    savors_text,
                    lock,
                    min_quality,
                    kind,
                    target: target as usize,
                });
            }
            raw.push(RawInstance {
                key,
                savors,
                state,
                deps,
            });
        }

        // Phase two: every key is known, resolve the (possibly forward)
        // dependency indices and build the immutable instances.
        let keys: Vec<ArtifactInstance> = raw.iter().map(|ri| ri.key.clone()).collect();
        let mut instances = Vec::with_capacity(raw.len());
        for ri in raw {
            let mut deps = Vec::with_capacity(ri.deps.len());
            for rd in ri.deps {
                let savors = match (&ri.savors, rd.savors_text) {
                    (Some(own), Some(text)) => {
                        Some(SavorSet::from_traits_text(own.context(), &text).ok_or_else(
                            || DepotError::Corrupt("empty dependency savor text".into()),
                        )?)
                    }
                    _ => None,
                };
                deps.push(Reference::new(
                    keys[rd.target].clone(),
                    rd.lock,
                    rd.min_quality,
                    rd.kind,
                    savors,
                ));
            }
            instances.push(Arc::new(PackageInstance::new(
                ri.key, ri.savors, ri.state, deps,
            )));
        }
        let store = InstanceStore::from_sorted(instances)?;

        let feed_count = r.varint()? as usize;
        let mut feeds: FxHashMap<String, PackageFeed> = FxHashMap::default();
        for _ in 0..feed_count {
            let artifact_type = r.shared_string()?;
            let name = r.string()?;
            let identity = Artifact::new(artifact_type, name)
                .map_err(|e| DepotError::Corrupt(e.to_string()))?;
            let member_count = r.i32()?;
            if member_count < 0 {
                return Err(DepotError::Corrupt("negative feed member count".into()));
            }
            let mut members = Vec::with_capacity((member_count as usize).min(MAX_PREALLOC));
            for _ in 0..member_count {
                let index = r.i32()?;
                if index < 0 || index as usize >= store.len() {
                    return Err(DepotError::Corrupt(format!(
                        "feed member index {} out of range",
                        index
                    )));
                }
                let p = store.instances()[index as usize].clone();
                if p.key().artifact_type() != identity.artifact_type() {
                    return Err(DepotError::Corrupt(format!(
                        "feed '{}' holds instance '{}' of another type",
                        identity, p
                    )));
                }
                members.push(p);
            }
            let feed = PackageFeed::new(identity.clone(), InstanceStore::from_sorted(members)?);
            if feeds.insert(feed.typed_name(), feed).is_some() {
                return Err(DepotError::Corrupt(format!(
                    "duplicate feed '{}'",
                    identity
                )));
            }
        }

        let millis = r.i64()?;
        let last_update = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| DepotError::Corrupt(format!("bad timestamp {}", millis)))?;
        Ok(PackageDatabase::from_parts(store, feeds, last_update, 0))
    }
}

struct Writer<'a, W: Write> {
    out: &'a mut W,
    strings: FxHashMap<String, u64>,
    savors: FxHashMap<SavorSet, u64>,
}

impl<'a, W: Write> Writer<'a, W> {
    fn new(out: &'a mut W) -> Self {
        Self {
            out,
            strings: FxHashMap::default(),
            savors: FxHashMap::default(),
        }
    }

    fn u8(&mut self, b: u8) -> Result<()> {
        self.out.write_all(&[b])?;
        Ok(())
    }

    fn i32(&mut self, v: i32) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn i64(&mut self, v: i64) -> Result<()> {
        self.out.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn varint(&mut self, mut v: u64) -> Result<()> {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.u8(byte)?;
                return Ok(());
            }
            self.u8(byte | 0x80)?;
        }
    }

    fn string(&mut self, s: &str) -> Result<()> {
        self.varint(s.len() as u64)?;
        self.out.write_all(s.as_bytes())?;
        Ok(())
    }

    /// Stream-wide deduplicated string: a back-reference when already
    /// written, marker 0 plus the full text the first time.
    fn shared_string(&mut self, s: &str) -> Result<()> {
        if let Some(&idx) = self.strings.get(s) {
            return self.varint(idx + 1);
        }
        let idx = self.strings.len() as u64;
        self.strings.insert(s.to_string(), idx);
        self.varint(0)?;
        self.string(s)
    }

    /// Pooled savor-set encoding: 0 = none, 1 = full encoding follows (the
    /// context itself goes through the shared string pool), n >= 2 =
    /// back-reference to pool entry n - 2.
    fn savors(&mut self, savors: Option<&SavorSet>) -> Result<()> {
        let Some(s) = savors else {
            return self.varint(0);
        };
        if let Some(&idx) = self.savors.get(s) {
            return self.varint(idx + 2);
        }
        let idx = self.savors.len() as u64;
        self.savors.insert(s.clone(), idx);
        self.varint(1)?;
        self.shared_string(s.context())?;
        self.string(&s.traits_text())
    }
}

struct Reader<'a, R: Read> {
    input: &'a mut R,
    strings: Vec<String>,
    savors: Vec<SavorSet>,
}

impl<'a, R: Read> Reader<'a, R> {
    fn new(input: &'a mut R) -> Self {
        Self {
            input,
            strings: Vec::new(),
            savors: Vec::new(),
        }
    }

    fn u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.input.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.input.read_exact(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    fn i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.input.read_exact(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    fn varint(&mut self) -> Result<u64> {
        let mut v = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            if shift >= 64 {
                return Err(DepotError::Corrupt("varint overflow".into()));
            }
            v |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }

    fn string(&mut self) -> Result<String> {
        let len = self.varint()?;
        if len > MAX_STRING_LEN {
            return Err(DepotError::Corrupt(format!("string length {}", len)));
        }
        let mut buf = vec![0u8; len as usize];
        self.input.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| DepotError::Corrupt(format!("invalid utf-8: {}", e)))
    }

    fn shared_string(&mut self) -> Result<String> {
        let marker = self.varint()?;
        if marker == 0 {
            let s = self.string()?;
            self.strings.push(s.clone());
            return Ok(s);
        }
        let idx = (marker - 1) as usize;
        self.strings
            .get(idx)
            .cloned()
            .ok_or_else(|| DepotError::Corrupt(format!("string back-reference {}", idx)))
    }

    fn savors(&mut self) -> Result<Option<SavorSet>> {
        match self.varint()? {
            0 => Ok(None),
            1 => {
                let context = self.shared_string()?;
                let text = self.string()?;
                let s = SavorSet::from_traits_text(&context, &text)
                    .ok_or_else(|| DepotError::Corrupt("empty savor set".into()))?;
                self.savors.push(s.clone());
                Ok(Some(s))
            }
            n => {
                let idx = (n - 2) as usize;
                self.savors
                    .get(idx)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| DepotError::Corrupt(format!("savor back-reference {}", idx)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for v in [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            Writer::new(&mut buf).varint(v).unwrap();
            let mut slice = buf.as_slice();
            assert_eq!(Reader::new(&mut slice).varint().unwrap(), v);
        }
    }

    #[test]
    fn truncated_stream_is_corrupt() {
        let db = PackageDatabase::empty();
        let mut buf = Vec::new();
        db.write(&mut buf).unwrap();
        buf.truncate(buf.len() - 1);
        let mut slice = buf.as_slice();
        assert!(PackageDatabase::read(&mut slice).is_err());
    }

    #[test]
    fn absurd_dependency_count_is_an_error() {
        // One valid instance header claiming u64::MAX dependencies.
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf);
        w.varint(FORMAT_VERSION).unwrap();
        w.i32(1).unwrap();
        w.u8(TAG_NEW_TYPE).unwrap();
        w.shared_string("NuGet").unwrap();
        w.string("Foo").unwrap();
        w.string("1.0.0").unwrap();
        w.varint(0).unwrap();
        w.u8(0).unwrap();
        w.varint(u64::MAX).unwrap();

        let mut slice = buf.as_slice();
        assert!(PackageDatabase::read(&mut slice).is_err());
    }

    #[test]
    fn absurd_instance_count_is_an_error() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf);
        w.varint(FORMAT_VERSION).unwrap();
        w.i32(i32::MAX).unwrap();

        let mut slice = buf.as_slice();
        assert!(PackageDatabase::read(&mut slice).is_err());
    }

    #[test]
    fn empty_database_round_trips() {
        let db = PackageDatabase::empty();
        let mut buf = Vec::new();
        db.write(&mut buf).unwrap();
        let mut slice = buf.as_slice();
        let back = PackageDatabase::read(&mut slice).unwrap();
        assert!(back.instances().is_empty());
        assert_eq!(back.feed_count(), 0);
        assert_eq!(back.last_update(), db.last_update());
    }
}

//! APK database merging.
//!
//! Every init-section image may carry its own `lib/apk/db/installed`, and a
//! naive copy would leave only the last one visible in the merged root
//! filesystem. This decorator swallows each copy as it streams past and
//! emits a single concatenated database when the init section closes, so
//! `apk` inside the built system sees the packages of every init image.

use anyhow::{Context, Result};
use std::io::Read;

use super::{write_bytes, ArchiveEntry, ArchiveSink, Provenance};

/// Path of the APK installed-package database inside a root filesystem.
pub const INSTALLED_PATH: &str = "lib/apk/db/installed";

/// Provenance source recorded on the merged database entry. It has no single
/// source image, so it carries a fixed marker instead of a reference.
pub const APK_DB_SOURCE: &str = "appliance.apk";

/// Decorator that collects `lib/apk/db/installed` entries and writes the
/// concatenation once, on [`ArchiveSink::finish`].
pub struct ApkDbMerger<S> {
    inner: S,
    location: String,
    dbs: Vec<Vec<u8>>,
}

impl<S: ArchiveSink> ApkDbMerger<S> {
    pub fn new(inner: S, location: impl Into<String>) -> Self {
        ApkDbMerger {
            inner,
            location: location.into(),
            dbs: Vec::new(),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ArchiveSink> ArchiveSink for ApkDbMerger<S> {
    fn write_entry(&mut self, entry: ArchiveEntry, data: &mut dyn Read) -> Result<()> {
        let is_db = entry.header.entry_type() == tar::EntryType::Regular
            && entry.path.trim_start_matches("./") == INSTALLED_PATH;
        if !is_db {
            return self.inner.write_entry(entry, data);
        }
        let mut db = Vec::with_capacity(entry.size() as usize);
        data.take(entry.size())
            .read_to_end(&mut db)
            .context("reading apk database")?;
        // installed-db records are blank-line separated and each file ends
        // with a newline; guarantee the separator survives concatenation
        if !db.ends_with(b"\n") {
            db.push(b'\n');
        }
        self.dbs.push(db);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.dbs.is_empty() {
            return Ok(());
        }
        let merged: Vec<u8> = self.dbs.drain(..).flatten().collect();
        let provenance = Provenance::new(APK_DB_SOURCE, &self.location);
        let entry = ArchiveEntry::file(INSTALLED_PATH, 0o644, merged.len() as u64)
            .with_provenance(&provenance);
        tracing::debug!(size = merged.len(), "writing merged apk database");
        write_bytes(&mut self.inner, entry, &merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{read_provenance, TarSink};

    #[test]
    fn merges_databases_from_multiple_images() {
        let sink = TarSink::new(Vec::new());
        let mut merger = ApkDbMerger::new(sink, "init");

        write_bytes(
            &mut merger,
            ArchiveEntry::file("bin/init", 0o755, 0),
            b"elf",
        )
        .unwrap();
        write_bytes(
            &mut merger,
            ArchiveEntry::file(INSTALLED_PATH, 0o644, 0),
            b"P:musl\n\n",
        )
        .unwrap();
        write_bytes(
            &mut merger,
            ArchiveEntry::file(INSTALLED_PATH, 0o644, 0),
            b"P:busybox\n",
        )
        .unwrap();
        merger.finish().unwrap();

        let mut sink = merger.into_inner();
        sink.finish().unwrap();
        let bytes = sink.into_inner().unwrap();

        let mut archive = tar::Archive::new(&bytes[..]);
        let mut entries = archive.entries().unwrap();

        let first = entries.next().unwrap().unwrap();
        assert_eq!(first.path().unwrap().to_str().unwrap(), "bin/init");
        drop(first);

        let mut db = entries.next().unwrap().unwrap();
        assert_eq!(db.path().unwrap().to_str().unwrap(), INSTALLED_PATH);
        assert_eq!(
            read_provenance(&mut db).unwrap(),
            Some(Provenance::new(APK_DB_SOURCE, "init"))
        );
        let mut content = String::new();
        db.read_to_string(&mut content).unwrap();
        assert_eq!(content, "P:musl\n\nP:busybox\n");
        drop(db);
        assert!(entries.next().is_none());
    }

    #[test]
    fn finish_is_a_no_op_without_databases() {
        let sink = TarSink::new(Vec::new());
        let mut merger = ApkDbMerger::new(sink, "init");
        write_bytes(&mut merger, ArchiveEntry::file("etc/os-release", 0o644, 0), b"x").unwrap();
        merger.finish().unwrap();

        let mut sink = merger.into_inner();
        sink.finish().unwrap();
        let bytes = sink.into_inner().unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        assert_eq!(archive.entries().unwrap().count(), 1);
    }
}

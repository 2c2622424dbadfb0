//! Archive sink capability and the tar implementation.
//!
//! Every stage of the build writes through [`ArchiveSink`] rather than a
//! concrete tar writer, so filtering and demultiplexing stages (the kernel
//! extractor, the APK database merger) compose as decorators over the base
//! sink. The base [`TarSink`] writes PAX-format tar entries and attaches the
//! two provenance records that make incremental reuse possible.

pub mod apk;

use anyhow::{Context, Result};
use std::io::{self, Read, Write};

/// PAX record carrying the canonical source image reference of an entry.
pub const PAX_SOURCE: &str = "APPLIANCE.source";
/// PAX record carrying the logical manifest location (`"onboot[2]"`).
pub const PAX_LOCATION: &str = "APPLIANCE.location";

/// Fixed modification time stamped onto every synthesized entry, so repeated
/// builds of the same manifest are byte-identical.
pub const DEFAULT_MTIME: u64 = 0;

/// Out-of-band identity of an archive entry: which image it came from and
/// where in the manifest that image was declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub source: String,
    pub location: String,
}

impl Provenance {
    pub fn new(source: impl Into<String>, location: impl Into<String>) -> Self {
        Provenance {
            source: source.into(),
            location: location.into(),
        }
    }
}

/// One archive entry: a tar header plus the path and link target kept out of
/// the fixed-width header fields so long names survive intact.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub header: tar::Header,
    pub path: String,
    pub link_target: Option<String>,
    pub provenance: Option<Provenance>,
}

impl ArchiveEntry {
    fn new(path: impl Into<String>, entry_type: tar::EntryType, mode: u32) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(mode);
        header.set_size(0);
        header.set_mtime(DEFAULT_MTIME);
        header.set_uid(0);
        header.set_gid(0);
        ArchiveEntry {
            header,
            path: path.into(),
            link_target: None,
            provenance: None,
        }
    }

    /// A directory entry with the given mode.
    pub fn dir(path: impl Into<String>, mode: u32) -> Self {
        Self::new(path, tar::EntryType::Directory, mode)
    }

    /// A regular file entry; `size` bytes of content must accompany it.
    pub fn file(path: impl Into<String>, mode: u32, size: u64) -> Self {
        let mut e = Self::new(path, tar::EntryType::Regular, mode);
        e.header.set_size(size);
        e
    }

    /// A symlink entry pointing at `target`.
    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        let mut e = Self::new(path, tar::EntryType::Symlink, 0o644);
        e.link_target = Some(target.into());
        e
    }

    pub fn with_provenance(mut self, provenance: &Provenance) -> Self {
        self.provenance = Some(provenance.clone());
        self
    }

    pub fn with_owner(mut self, uid: u64, gid: u64) -> Self {
        self.header.set_uid(uid);
        self.header.set_gid(gid);
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.header.set_mode(mode);
        self
    }

    /// Size recorded in the header.
    pub fn size(&self) -> u64 {
        self.header.size().unwrap_or(0)
    }

    pub fn is_dir(&self) -> bool {
        self.header.entry_type().is_dir()
    }
}

/// Capability to receive an ordered stream of archive entries.
///
/// Implementations either write to a real archive ([`TarSink`]) or decorate
/// another sink, filtering or rewriting the stream on the way through.
pub trait ArchiveSink {
    /// Write one entry. `data` must yield exactly the number of bytes the
    /// entry's header declares.
    fn write_entry(&mut self, entry: ArchiveEntry, data: &mut dyn Read) -> Result<()>;

    /// Flush anything the sink buffered. Decorators finalize their own state
    /// without closing the sink they wrap.
    fn finish(&mut self) -> Result<()>;
}

impl<S: ArchiveSink + ?Sized> ArchiveSink for &mut S {
    fn write_entry(&mut self, entry: ArchiveEntry, data: &mut dyn Read) -> Result<()> {
        (**self).write_entry(entry, data)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Convenience for entries with no content (directories, symlinks).
pub fn write_empty(sink: &mut dyn ArchiveSink, entry: ArchiveEntry) -> Result<()> {
    sink.write_entry(entry, &mut io::empty())
}

/// Convenience for regular-file entries backed by an in-memory buffer.
pub fn write_bytes(sink: &mut dyn ArchiveSink, mut entry: ArchiveEntry, data: &[u8]) -> Result<()> {
    entry.header.set_size(data.len() as u64);
    sink.write_entry(entry, &mut &data[..])
}

/// The base sink: a PAX tar stream over any writer.
pub struct TarSink<W: Write> {
    builder: tar::Builder<W>,
}

impl<W: Write> TarSink<W> {
    pub fn new(writer: W) -> Self {
        TarSink {
            builder: tar::Builder::new(writer),
        }
    }

    /// Finish the archive and recover the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        self.builder
            .into_inner()
            .context("finishing system archive")
    }
}

impl<W: Write> ArchiveSink for TarSink<W> {
    fn write_entry(&mut self, entry: ArchiveEntry, data: &mut dyn Read) -> Result<()> {
        let ArchiveEntry {
            mut header,
            path,
            link_target,
            provenance,
        } = entry;
        if let Some(p) = &provenance {
            self.builder
                .append_pax_extensions([
                    (PAX_SOURCE, p.source.as_bytes()),
                    (PAX_LOCATION, p.location.as_bytes()),
                ])
                .with_context(|| format!("writing provenance for {path}"))?;
        }
        match link_target {
            Some(target) => self
                .builder
                .append_link(&mut header, &path, &target)
                .with_context(|| format!("writing link entry {path}"))?,
            None => {
                let size = header.size().unwrap_or(0);
                self.builder
                    .append_data(&mut header, &path, data.take(size))
                    .with_context(|| format!("writing entry {path}"))?
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.builder.finish().context("closing system archive")
    }
}

/// Read the provenance records off a tar entry, if present.
pub fn read_provenance<R: Read>(entry: &mut tar::Entry<R>) -> Result<Option<Provenance>> {
    let Some(extensions) = entry.pax_extensions()? else {
        return Ok(None);
    };
    let mut source = None;
    let mut location = None;
    for ext in extensions {
        let ext = ext?;
        match ext.key() {
            Ok(PAX_SOURCE) => source = Some(ext.value().unwrap_or_default().to_string()),
            Ok(PAX_LOCATION) => location = Some(ext.value().unwrap_or_default().to_string()),
            _ => {}
        }
    }
    Ok(match (source, location) {
        (Some(source), Some(location)) => Some(Provenance { source, location }),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_provenance_records() {
        let mut sink = TarSink::new(Vec::new());
        let prov = Provenance::new("docker.io/library/img:latest", "services[0]");
        write_bytes(
            &mut sink,
            ArchiveEntry::file("etc/config", 0o644, 0).with_provenance(&prov),
            b"hello",
        )
        .unwrap();
        write_empty(&mut sink, ArchiveEntry::dir("plain", 0o755)).unwrap();
        let bytes = sink.into_inner().unwrap();

        let mut archive = tar::Archive::new(&bytes[..]);
        let mut entries = archive.entries().unwrap();

        let mut first = entries.next().unwrap().unwrap();
        assert_eq!(first.path().unwrap().to_str().unwrap(), "etc/config");
        assert_eq!(read_provenance(&mut first).unwrap(), Some(prov));
        let mut content = String::new();
        first.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");

        let mut second = entries.next().unwrap().unwrap();
        assert_eq!(read_provenance(&mut second).unwrap(), None);
        assert!(entries.next().is_none());
    }

    #[test]
    fn long_paths_survive() {
        let long = format!("{}/leaf", "d/".repeat(80).trim_end_matches('/'));
        let mut sink = TarSink::new(Vec::new());
        write_bytes(&mut sink, ArchiveEntry::file(&long, 0o644, 0), b"x").unwrap();
        let bytes = sink.into_inner().unwrap();

        let mut archive = tar::Archive::new(&bytes[..]);
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str().unwrap(), long);
    }
}

//! Image tar pipeline: rewrite an image's root filesystem into the archive.
//!
//! Each entry of the pulled root filesystem is copied under a destination
//! prefix with a fixed set of rewrites applied on the way through: container
//! runtime artifacts are dropped, `/etc/hosts` and `/etc/resolv.conf` are
//! replaced with canonical content, hard link targets are re-prefixed, and a
//! small set of entries the boot-time init depends on is synthesized when
//! the source image lacks them.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::io;

use crate::archive::{write_bytes, write_empty, ArchiveEntry, ArchiveSink, Provenance};
use crate::reference::ImageRef;
use crate::registry::ImageSource;

/// Entries dropped from every image: build/runtime artifacts of the tool
/// that exported the filesystem, and device paths the init process mounts
/// over.
const EXCLUDE: &[&str] = &[
    ".dockerenv",
    "Dockerfile",
    "dev/console",
    "dev/pts",
    "dev/shm",
    "etc/hostname",
];

const HOSTS_CONTENT: &str = "127.0.0.1       localhost
::1     localhost ip6-localhost ip6-loopback
fe00::0 ip6-localnet
ff00::0 ip6-mcastprefix
ff02::1 ip6-allnodes
ff02::2 ip6-allrouters
";

const RESOLV_CONF_CONTENT: &str = "\n# no resolv.conf configured\n";

/// Replacement content keyed by path, applied unless the caller supplied a
/// resolv.conf symlink target.
fn replacement(name: &str) -> Option<&'static str> {
    match name {
        "etc/hosts" => Some(HOSTS_CONTENT),
        "etc/resolv.conf" => Some(RESOLV_CONF_CONTENT),
        _ => None,
    }
}

/// Paths that must exist in every extracted root filesystem; synthesized at
/// the end if the source image did not carry them.
const TOUCH: &[&str] = &[
    "dev",
    "dev/pts",
    "dev/shm",
    "etc",
    "etc/hosts",
    "etc/mtab",
    "etc/resolv.conf",
    "proc",
    "sys",
];

fn touch_entry(name: &str) -> ArchiveEntry {
    match name {
        "etc/mtab" => ArchiveEntry::symlink("etc/mtab", "/proc/mounts").with_mode(0o755),
        "etc/hosts" | "etc/resolv.conf" => ArchiveEntry::file(name, 0o644, 0),
        _ => ArchiveEntry::dir(name, 0o755),
    }
}

/// Write the chain of directories leading up to `prefix`.
///
/// `prefix` must be relative and end with `/`; anything else is a caller
/// bug, not an input error.
pub fn tar_prefix(
    prefix: &str,
    location: &str,
    source: &str,
    sink: &mut dyn ArchiveSink,
) -> Result<()> {
    if prefix.is_empty() {
        return Ok(());
    }
    assert!(prefix.ends_with('/'), "prefix does not end with /: {prefix}");
    assert!(!prefix.starts_with('/'), "prefix should be relative: {prefix}");
    let provenance = Provenance::new(source, location);
    let mut built = String::new();
    for dir in prefix.trim_end_matches('/').split('/') {
        built.push_str(dir);
        write_empty(
            sink,
            ArchiveEntry::dir(&built, 0o755).with_provenance(&provenance),
        )?;
        built.push('/');
    }
    Ok(())
}

/// Copy one image's root filesystem into the sink under `prefix`, applying
/// the exclusion/substitution/touch rules. Every written entry carries the
/// provenance pair (`reference`, `location`).
///
/// When `resolv_symlink` is given, `/etc/resolv.conf` becomes a symlink to
/// it instead of the canonical placeholder content.
pub fn image_tar(
    location: &str,
    reference: &ImageRef,
    prefix: &str,
    sink: &mut dyn ArchiveSink,
    resolv_symlink: Option<&str>,
    image: &dyn ImageSource,
) -> Result<()> {
    tracing::debug!(%reference, prefix, "image tar");
    assert!(
        prefix.is_empty() || prefix.ends_with('/'),
        "prefix does not end with /: {prefix}"
    );

    let source = reference.to_string();
    tar_prefix(prefix, location, &source, sink)?;
    let provenance = Provenance::new(&source, location);

    let contents = image
        .rootfs_tar()
        .with_context(|| format!("could not unpack image {reference}"))?;
    let mut archive = tar::Archive::new(contents);

    // track which of the must-exist entries the image provided
    let mut touch_found: BTreeSet<&str> = BTreeSet::new();

    for entry in archive.entries().context("reading image filesystem")? {
        let mut entry = entry.context("reading image filesystem entry")?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let name = path.trim_start_matches("./").trim_end_matches('/').to_string();
        if name.is_empty() {
            continue;
        }

        if EXCLUDE.contains(&name.as_str()) {
            tracing::debug!(%reference, name, "image tar: exclude");
            io::copy(&mut entry, &mut io::sink())?;
            continue;
        }

        if let Some(content) = replacement(&name) {
            if name == "etc/resolv.conf" && resolv_symlink.is_some() {
                let resolv = resolv_symlink.unwrap();
                tracing::debug!(%reference, resolv, "image tar: resolv.conf symlink");
                write_empty(
                    sink,
                    ArchiveEntry::symlink(format!("{prefix}{name}"), resolv)
                        .with_provenance(&provenance),
                )?;
            } else {
                tracing::debug!(%reference, name, "image tar: replace");
                let mut out = ArchiveEntry {
                    header: entry.header().clone(),
                    path: format!("{prefix}{name}"),
                    link_target: None,
                    provenance: Some(provenance.clone()),
                };
                out.header.set_mtime(crate::archive::DEFAULT_MTIME);
                write_bytes(sink, out, content.as_bytes())?;
            }
            touch_found.insert(TOUCH.iter().copied().find(|t| *t == name).unwrap());
            io::copy(&mut entry, &mut io::sink())?;
            continue;
        }

        let mut out = ArchiveEntry {
            header: entry.header().clone(),
            path: format!("{prefix}{name}"),
            link_target: entry
                .link_name()?
                .map(|l| l.to_string_lossy().into_owned()),
            provenance: Some(provenance.clone()),
        };
        if let Some(touched) = TOUCH.iter().copied().find(|t| *t == name) {
            // these may exist with an export-time timestamp; pin it
            out.header.set_mtime(crate::archive::DEFAULT_MTIME);
            touch_found.insert(touched);
        }
        if entry.header().entry_type() == tar::EntryType::Link {
            // hard links are referenced by full path so need to be adjusted
            if let Some(target) = out.link_target.take() {
                out.link_target = Some(format!("{prefix}{target}"));
            }
        }
        tracing::debug!(%reference, name, "image tar: add");
        sink.write_entry(out, &mut entry)?;
    }

    // synthesize whatever the image did not provide, in a fixed order
    for name in TOUCH {
        if touch_found.contains(name) {
            continue;
        }
        tracing::debug!(name, "image tar: creating");
        let mut entry = touch_entry(name);
        entry.path = format!("{prefix}{name}");
        entry = entry.with_provenance(&provenance);
        match (*name, resolv_symlink) {
            ("etc/resolv.conf", Some(resolv)) => {
                entry.link_target = Some(resolv.to_string());
                entry.header.set_entry_type(tar::EntryType::Symlink);
                write_empty(sink, entry)?;
            }
            ("etc/resolv.conf", None) => {
                write_bytes(sink, entry, RESOLV_CONF_CONTENT.as_bytes())?
            }
            ("etc/hosts", _) => write_bytes(sink, entry, HOSTS_CONTENT.as_bytes())?,
            _ => write_empty(sink, entry)?,
        }
    }

    Ok(())
}

/// Copy a raw tar stream (an OCI image layout) into the sink under
/// `prefix`, tagging every entry with the given provenance.
pub fn append_tar(
    location: &str,
    source: &str,
    prefix: &str,
    sink: &mut dyn ArchiveSink,
    reader: Box<dyn io::Read>,
) -> Result<()> {
    assert!(
        prefix.is_empty() || prefix.ends_with('/'),
        "prefix does not end with /: {prefix}"
    );
    let provenance = Provenance::new(source, location);
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().context("reading tar stream")? {
        let mut entry = entry.context("reading tar stream entry")?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let name = path.trim_start_matches("./").trim_end_matches('/');
        if name.is_empty() {
            continue;
        }
        let out = ArchiveEntry {
            header: entry.header().clone(),
            path: format!("{prefix}{name}"),
            link_target: entry
                .link_name()?
                .map(|l| l.to_string_lossy().into_owned()),
            provenance: Some(provenance.clone()),
        };
        sink.write_entry(out, &mut entry)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::archive::TarSink;
    use crate::registry::ImageDefaults;
    use std::io::Read;

    /// In-memory image whose rootfs is built from (path, content) pairs.
    pub(crate) struct FakeImage {
        pub defaults: ImageDefaults,
        pub rootfs: Vec<u8>,
    }

    pub(crate) fn rootfs_from(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            if path.ends_with('/') {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, path.trim_end_matches('/'), io::empty())
                    .unwrap();
            } else {
                let mut header = tar::Header::new_gnu();
                header.set_mode(0o644);
                header.set_size(content.len() as u64);
                builder
                    .append_data(&mut header, *path, content.as_bytes())
                    .unwrap();
            }
        }
        builder.into_inner().unwrap()
    }

    impl ImageSource for FakeImage {
        fn config(&self) -> Result<ImageDefaults> {
            Ok(self.defaults.clone())
        }

        fn rootfs_tar(&self) -> Result<Box<dyn Read>> {
            Ok(Box::new(io::Cursor::new(self.rootfs.clone())))
        }

        fn oci_layout_tar(&self) -> Result<Box<dyn Read>> {
            Ok(Box::new(io::Cursor::new(self.rootfs.clone())))
        }
    }

    fn extract(bytes: &[u8]) -> Vec<(String, String)> {
        let mut archive = tar::Archive::new(bytes);
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            out.push((path, content));
        }
        out
    }

    fn run_image_tar(rootfs: Vec<u8>, prefix: &str, resolv: Option<&str>) -> Vec<(String, String)> {
        let image = FakeImage {
            defaults: ImageDefaults::default(),
            rootfs,
        };
        let reference = ImageRef::parse("img:tag").unwrap();
        let mut sink = TarSink::new(Vec::new());
        image_tar("services[0]", &reference, prefix, &mut sink, resolv, &image).unwrap();
        sink.finish().unwrap();
        extract(&sink.into_inner().unwrap())
    }

    #[test]
    fn prefixes_and_filters_entries() {
        let rootfs = rootfs_from(&[
            ("bin/", ""),
            ("bin/sh", "#!"),
            (".dockerenv", ""),
            ("etc/hostname", "drop-me"),
        ]);
        let entries = run_image_tar(rootfs, "root/", None);
        let paths: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();
        assert!(paths.contains(&"root"));
        assert!(paths.contains(&"root/bin/sh"));
        assert!(!paths.iter().any(|p| p.contains("dockerenv")));
        assert!(!paths.iter().any(|p| p.contains("hostname")));
    }

    #[test]
    fn replaces_hosts_and_resolv_conf() {
        let rootfs = rootfs_from(&[("etc/", ""), ("etc/hosts", "tampered"), ("etc/resolv.conf", "old")]);
        let entries = run_image_tar(rootfs, "", None);
        let hosts = entries.iter().find(|(p, _)| p == "etc/hosts").unwrap();
        assert!(hosts.1.starts_with("127.0.0.1"));
        let resolv = entries.iter().find(|(p, _)| p == "etc/resolv.conf").unwrap();
        assert!(resolv.1.contains("no resolv.conf configured"));
    }

    #[test]
    fn resolv_symlink_overrides_replacement() {
        let rootfs = rootfs_from(&[("etc/", ""), ("etc/resolv.conf", "old")]);
        let image = FakeImage {
            defaults: ImageDefaults::default(),
            rootfs,
        };
        let reference = ImageRef::parse("img:tag").unwrap();
        let mut sink = TarSink::new(Vec::new());
        image_tar(
            "init[0]",
            &reference,
            "",
            &mut sink,
            Some("/run/resolvconf/resolv.conf"),
            &image,
        )
        .unwrap();
        sink.finish().unwrap();
        let bytes = sink.into_inner().unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let entry = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().to_str() == Some("etc/resolv.conf"))
            .unwrap();
        assert_eq!(entry.header().entry_type(), tar::EntryType::Symlink);
        assert_eq!(
            entry.link_name().unwrap().unwrap().to_str().unwrap(),
            "/run/resolvconf/resolv.conf"
        );
    }

    #[test]
    fn synthesizes_missing_boot_critical_entries() {
        let entries = run_image_tar(rootfs_from(&[("bin/sh", "#!")]), "", None);
        let paths: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();
        for expected in ["dev", "dev/pts", "dev/shm", "etc", "proc", "sys", "etc/mtab"] {
            assert!(paths.contains(&expected), "missing {expected}: {paths:?}");
        }
    }

    #[test]
    fn hard_link_targets_are_prefixed() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(2);
        builder.append_data(&mut header, "bin/a", &b"hi"[..]).unwrap();
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Link);
        link.set_size(0);
        builder.append_link(&mut link, "bin/b", "bin/a").unwrap();
        let rootfs = builder.into_inner().unwrap();

        let image = FakeImage {
            defaults: ImageDefaults::default(),
            rootfs,
        };
        let reference = ImageRef::parse("img:tag").unwrap();
        let mut sink = TarSink::new(Vec::new());
        image_tar("services[0]", &reference, "pfx/", &mut sink, None, &image).unwrap();
        sink.finish().unwrap();
        let bytes = sink.into_inner().unwrap();

        let mut archive = tar::Archive::new(&bytes[..]);
        let entry = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().to_str() == Some("pfx/bin/b"))
            .unwrap();
        assert_eq!(
            entry.link_name().unwrap().unwrap().to_str().unwrap(),
            "pfx/bin/a"
        );
    }

    #[test]
    #[should_panic(expected = "prefix does not end with /")]
    fn malformed_prefix_is_a_caller_bug() {
        let mut sink = TarSink::new(Vec::new());
        tar_prefix("oops", "services[0]", "img", &mut sink).unwrap();
    }
}

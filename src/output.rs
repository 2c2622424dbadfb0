//! Output formats and the converter seam.
//!
//! The build itself always produces the tar system archive; turning that
//! into a bootable artifact (ISO, raw disk, cloud image) is delegated to a
//! [`Converter`]. This module owns the closed set of formats and the demux
//! that splits the archive into the pieces kernel-bearing converters need.

use anyhow::{Context, Result};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use crate::archive::{read_provenance, ArchiveEntry, ArchiveSink, TarSink};
use crate::error::BuildError;

/// Every artifact format a system archive can be converted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    /// The system archive itself, unconverted.
    Tar,
    /// Separate kernel, initrd and cmdline files.
    KernelInitrd,
    /// BIOS-bootable ISO.
    IsoBios,
    /// EFI-bootable ISO.
    IsoEfi,
    /// BIOS-bootable raw disk image.
    RawBios,
    /// EFI-bootable raw disk image.
    RawEfi,
    /// EFI-bootable qcow2 disk image.
    Qcow2Efi,
    /// Fixed VHD disk image.
    Vhd,
    /// AMI-compatible image for AWS.
    Aws,
    /// GCE-compatible image for GCP.
    Gcp,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 10] = [
        OutputFormat::Tar,
        OutputFormat::KernelInitrd,
        OutputFormat::IsoBios,
        OutputFormat::IsoEfi,
        OutputFormat::RawBios,
        OutputFormat::RawEfi,
        OutputFormat::Qcow2Efi,
        OutputFormat::Vhd,
        OutputFormat::Aws,
        OutputFormat::Gcp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            OutputFormat::Tar => "tar",
            OutputFormat::KernelInitrd => "kernel+initrd",
            OutputFormat::IsoBios => "iso-bios",
            OutputFormat::IsoEfi => "iso-efi",
            OutputFormat::RawBios => "raw-bios",
            OutputFormat::RawEfi => "raw-efi",
            OutputFormat::Qcow2Efi => "qcow2-efi",
            OutputFormat::Vhd => "vhd",
            OutputFormat::Aws => "aws",
            OutputFormat::Gcp => "gcp",
        }
    }

    /// Whether conversion needs the manifest to have configured a kernel.
    pub fn requires_kernel(&self) -> bool {
        !matches!(self, OutputFormat::Tar)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutputFormat {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OutputFormat::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| BuildError::Validation(format!("unknown output format: {s}")))
    }
}

/// Turns a system archive into a bootable artifact.
///
/// Implementations live outside this crate (they shell out to image tooling
/// or cloud APIs); the build hands them the archive stream, an optional
/// target size in MB and the architecture being built for.
pub trait Converter {
    fn convert(
        &self,
        format: OutputFormat,
        archive: &mut dyn Read,
        size_mb: Option<u64>,
        architecture: &str,
    ) -> Result<()>;
}

/// A system archive demultiplexed for kernel-bearing converters.
pub struct SplitArchive {
    /// Content of `boot/kernel`.
    pub kernel: Option<Vec<u8>>,
    /// Content of `boot/cmdline`.
    pub cmdline: Option<String>,
    /// Content of `boot/ucode.cpio`.
    pub ucode: Option<Vec<u8>>,
    /// Every remaining entry, re-framed as a tar stream; converters turn
    /// this into the initrd payload.
    pub initrd: Vec<u8>,
}

/// Split the `boot/` entries out of a system archive.
pub fn split_kernel(archive: impl Read) -> Result<SplitArchive> {
    let mut kernel = None;
    let mut cmdline = None;
    let mut ucode = None;
    let mut rest = TarSink::new(Vec::new());

    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries().context("reading system archive")? {
        let mut entry = entry.context("reading system archive entry")?;
        let path = entry.path()?.to_string_lossy().into_owned();
        match path.trim_end_matches('/') {
            "boot" => continue,
            "boot/kernel" => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                kernel = Some(buf);
            }
            "boot/cmdline" => {
                let mut buf = String::new();
                entry.read_to_string(&mut buf)?;
                cmdline = Some(buf);
            }
            "boot/ucode.cpio" => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                ucode = Some(buf);
            }
            _ => {
                let provenance = read_provenance(&mut entry)?;
                let out = ArchiveEntry {
                    header: entry.header().clone(),
                    path,
                    link_target: entry
                        .link_name()?
                        .map(|l| l.to_string_lossy().into_owned()),
                    provenance,
                };
                rest.write_entry(out, &mut entry)?;
            }
        }
    }
    rest.finish()?;
    Ok(SplitArchive {
        kernel,
        cmdline,
        ucode,
        initrd: rest.into_inner()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{write_bytes, write_empty};

    #[test]
    fn format_names_round_trip() {
        for format in OutputFormat::ALL {
            assert_eq!(format.name().parse::<OutputFormat>().unwrap(), format);
        }
        assert!("floppy".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn only_tar_skips_the_kernel() {
        assert!(!OutputFormat::Tar.requires_kernel());
        assert!(OutputFormat::KernelInitrd.requires_kernel());
        assert!(OutputFormat::Qcow2Efi.requires_kernel());
    }

    #[test]
    fn split_separates_boot_entries_from_payload() {
        let mut sink = TarSink::new(Vec::new());
        write_empty(&mut sink, ArchiveEntry::dir("boot", 0o755)).unwrap();
        write_bytes(&mut sink, ArchiveEntry::file("boot/kernel", 0o644, 0), b"vmlinux").unwrap();
        write_bytes(
            &mut sink,
            ArchiveEntry::file("boot/cmdline", 0o644, 0),
            b"console=ttyS0",
        )
        .unwrap();
        write_bytes(&mut sink, ArchiveEntry::file("etc/issue", 0o644, 0), b"hi").unwrap();
        sink.finish().unwrap();
        let bytes = sink.into_inner().unwrap();

        let split = split_kernel(&bytes[..]).unwrap();
        assert_eq!(split.kernel.as_deref(), Some(&b"vmlinux"[..]));
        assert_eq!(split.cmdline.as_deref(), Some("console=ttyS0"));
        assert!(split.ucode.is_none());

        let mut rest = tar::Archive::new(&split.initrd[..]);
        let paths: Vec<String> = rest
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(paths, ["etc/issue"]);
    }
}

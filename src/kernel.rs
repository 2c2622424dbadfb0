//! Kernel extraction.
//!
//! A kernel image is a container image whose filesystem carries the kernel
//! binary, an optional tar of modules and firmware, and optionally microcode.
//! [`KernelFilter`] sits between that filesystem stream and the system
//! archive: it picks out the configured files, drops everything else, and
//! rewrites what it keeps into the `boot/` layout the output formats expect.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::io::{self, Read};

use crate::archive::{write_bytes, write_empty, ArchiveEntry, ArchiveSink, Provenance};
use crate::error::BuildError;

/// Manifest location recorded on every entry the kernel contributes.
pub const KERNEL_LOCATION: &str = "kernel";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// x86 boot protocol header offsets, per Documentation/x86/boot.rst
const BZ_MIN_LEN: usize = 0x250;
const BZ_SETUP_SECTS: usize = 0x1f1;
const BZ_BOOT_FLAG: usize = 0x1fe;
const BZ_HEADER: usize = 0x202;
const BZ_VERSION: usize = 0x206;
const BZ_PAYLOAD: usize = 0x248;
const BZ_PAYLOAD_LENGTH: usize = 0x24c;
const SECTOR_SIZE: usize = 512;

/// Filter a kernel image's filesystem down to the `boot/` entries.
///
/// Everything except the three configured files is discarded. The kernel
/// binary becomes `boot/kernel` (optionally decompressed), the command line
/// is written alongside it as `boot/cmdline`, microcode becomes
/// `boot/ucode.cpio`, and the module tar is expanded in place at the archive
/// root.
pub struct KernelFilter<S> {
    inner: S,
    provenance: Provenance,
    cmdline: String,
    kernel_name: String,
    tar_name: Option<String>,
    ucode_name: Option<String>,
    decompress: bool,
    found_kernel: bool,
    found_tar: bool,
    wrote_boot_dir: bool,
}

impl<S: ArchiveSink> KernelFilter<S> {
    /// `binary`, `aux_tar` and `ucode` are the in-image file names from the
    /// manifest; `binary` defaults to `kernel`, `aux_tar` to `kernel.tar`
    /// with the sentinel `none` disabling it, and `ucode` to nothing.
    pub fn new(
        inner: S,
        source: impl Into<String>,
        cmdline: impl Into<String>,
        binary: Option<&str>,
        aux_tar: Option<&str>,
        ucode: Option<&str>,
        decompress: bool,
    ) -> Self {
        let tar_name = match aux_tar {
            Some("none") => None,
            Some(name) => Some(name.to_string()),
            None => Some("kernel.tar".to_string()),
        };
        KernelFilter {
            inner,
            provenance: Provenance::new(source, KERNEL_LOCATION),
            cmdline: cmdline.into(),
            kernel_name: binary.unwrap_or("kernel").to_string(),
            tar_name,
            ucode_name: ucode.map(str::to_string),
            decompress,
            found_kernel: false,
            found_tar: false,
            wrote_boot_dir: false,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn ensure_boot_dir(&mut self) -> Result<()> {
        if self.wrote_boot_dir {
            return Ok(());
        }
        self.wrote_boot_dir = true;
        write_empty(
            &mut self.inner,
            ArchiveEntry::dir("boot", 0o755).with_provenance(&self.provenance),
        )
    }

    fn write_kernel(&mut self, buffer: Vec<u8>) -> Result<()> {
        let buffer = if self.decompress {
            decompress_kernel(&buffer)?
        } else {
            buffer
        };
        self.ensure_boot_dir()?;
        write_bytes(
            &mut self.inner,
            ArchiveEntry::file("boot/cmdline", 0o644, 0).with_provenance(&self.provenance),
            self.cmdline.as_bytes(),
        )?;
        write_bytes(
            &mut self.inner,
            ArchiveEntry::file("boot/kernel", 0o644, 0).with_provenance(&self.provenance),
            &buffer,
        )
    }

    fn expand_tar(&mut self, buffer: Vec<u8>) -> Result<()> {
        let mut archive = tar::Archive::new(&buffer[..]);
        for entry in archive.entries().context("reading kernel aux tar")? {
            let mut entry = entry.context("reading kernel aux tar entry")?;
            let path = entry.path()?.to_string_lossy().into_owned();
            let name = path.trim_start_matches("./").trim_end_matches('/');
            if name.is_empty() {
                continue;
            }
            let out = ArchiveEntry {
                header: entry.header().clone(),
                path: name.to_string(),
                link_target: entry
                    .link_name()?
                    .map(|l| l.to_string_lossy().into_owned()),
                provenance: Some(self.provenance.clone()),
            };
            self.inner.write_entry(out, &mut entry)?;
        }
        Ok(())
    }
}

impl<S: ArchiveSink> ArchiveSink for KernelFilter<S> {
    fn write_entry(&mut self, entry: ArchiveEntry, data: &mut dyn Read) -> Result<()> {
        let name = entry
            .path
            .trim_start_matches("./")
            .trim_end_matches('/')
            .to_string();
        if entry.header.entry_type() != tar::EntryType::Regular {
            io::copy(data, &mut io::sink())?;
            return Ok(());
        }

        if name == self.kernel_name {
            if self.found_kernel {
                return Err(BuildError::Validation(
                    "found more than one possible kernel image".to_string(),
                )
                .into());
            }
            self.found_kernel = true;
            let mut buffer = Vec::with_capacity(entry.size() as usize);
            data.take(entry.size()).read_to_end(&mut buffer)?;
            self.write_kernel(buffer)
        } else if self.tar_name.as_deref() == Some(&name) {
            self.found_tar = true;
            let mut buffer = Vec::with_capacity(entry.size() as usize);
            data.take(entry.size()).read_to_end(&mut buffer)?;
            self.expand_tar(buffer)
        } else if self.ucode_name.as_deref() == Some(&name) {
            self.ensure_boot_dir()?;
            let out = ArchiveEntry::file("boot/ucode.cpio", 0o644, entry.size())
                .with_provenance(&self.provenance);
            self.inner.write_entry(out, data)
        } else {
            io::copy(data, &mut io::sink())?;
            Ok(())
        }
    }

    fn finish(&mut self) -> Result<()> {
        if !self.found_kernel {
            return Err(BuildError::IncompleteKernelImage(format!(
                "did not find kernel binary {} in kernel image",
                self.kernel_name
            ))
            .into());
        }
        if let Some(tar_name) = &self.tar_name {
            if !self.found_tar {
                return Err(BuildError::IncompleteKernelImage(format!(
                    "did not find kernel aux tar {tar_name} in kernel image"
                ))
                .into());
            }
        }
        // microcode is best effort: images without it still boot
        Ok(())
    }
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .context("decompressing kernel")?;
    Ok(out)
}

fn u16le(b: &[u8], at: usize) -> u32 {
    u32::from(b[at]) | u32::from(b[at + 1]) << 8
}

fn u32le(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Recover the uncompressed vmlinux from a kernel binary: either a plain
/// gzip stream or an x86 bzImage whose embedded payload is gzipped.
pub fn decompress_kernel(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 2 && data[..2] == GZIP_MAGIC {
        tracing::debug!("decompressing gzipped kernel");
        return gunzip(data);
    }
    if data.len() >= BZ_MIN_LEN
        && data[BZ_BOOT_FLAG] == 0x55
        && data[BZ_BOOT_FLAG + 1] == 0xaa
        && &data[BZ_HEADER..BZ_HEADER + 4] == b"HdrS"
    {
        return extract_bz_image(data);
    }
    Err(BuildError::UnsupportedKernelFormat(
        "no supported compression format recognized".to_string(),
    )
    .into())
}

fn extract_bz_image(data: &[u8]) -> Result<Vec<u8>> {
    tracing::debug!("decompressing bzImage kernel");
    let version = u16le(data, BZ_VERSION);
    if version < 0x0208 {
        return Err(BuildError::UnsupportedKernelFormat(format!(
            "boot protocol {}.{:02} is too old",
            version >> 8,
            version & 0xff
        ))
        .into());
    }
    let mut setup_sectors = data[BZ_SETUP_SECTS] as usize;
    if setup_sectors == 0 {
        setup_sectors = 4;
    }
    let payload_offset = u32le(data, BZ_PAYLOAD) as usize;
    let payload_length = u32le(data, BZ_PAYLOAD_LENGTH) as usize;
    let start = (setup_sectors + 1) * SECTOR_SIZE + payload_offset;
    let end = start + payload_length;
    if end > data.len() {
        return Err(BuildError::UnsupportedKernelFormat(
            "bzImage payload extends past end of file".to_string(),
        )
        .into());
    }
    let payload = &data[start..end];
    if payload.len() < 2 || payload[..2] != GZIP_MAGIC {
        return Err(BuildError::UnsupportedKernelFormat(
            "bzImage payload is not gzip compressed".to_string(),
        )
        .into());
    }
    gunzip(payload)
}

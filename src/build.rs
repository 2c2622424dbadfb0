//! The build orchestrator.
//!
//! [`build`] walks the manifest in archive order: kernel, init images,
//! volumes, onboot/onshutdown/service bundles, then literal files. Each
//! stage writes through the shared [`ArchiveSink`], and when a prior
//! archive is supplied, any unit whose configuration is unchanged is copied
//! out of it by provenance instead of being pulled and re-extracted.

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::archive::apk::{ApkDbMerger, APK_DB_SOURCE};
use crate::archive::{
    read_provenance, write_bytes, write_empty, ArchiveEntry, ArchiveSink, Provenance, TarSink,
};
use crate::compile::{compile, id_numeric};
use crate::error::BuildError;
use crate::image::{append_tar, image_tar, tar_prefix};
use crate::kernel::{KernelFilter, KERNEL_LOCATION};
use crate::manifest::{File, Image, Manifest, MetadataFormat, Volume, VolumeFormat};
use crate::registry::{Platform, Registry};

/// Provenance source for volume scaffolding directories.
pub const VOLUME_SOURCE: &str = "appliance.volumes";
/// Provenance source for entries from the manifest `files:` section.
pub const FILES_SOURCE: &str = "appliance.files";

/// Where init images expect resolv.conf to live at runtime; their baked-in
/// copy is replaced with a symlink here.
const RESOLVCONF_SYMLINK: &str = "/run/resolvconf/resolv.conf";

/// A prior system archive, rewound and rescanned once per reusable unit.
pub trait InputArchive: Read + Seek {}
impl<T: Read + Seek> InputArchive for T {}

/// Build options.
#[derive(Default)]
pub struct BuildOpts {
    /// Decompress the kernel binary before writing `boot/kernel`.
    pub decompress_kernel: bool,
    /// Prior archive to reuse unchanged units from.
    pub input_tar: Option<Box<dyn InputArchive>>,
}

/// Per-build state threaded through the stages: the name→id allocation and
/// the image dedup map.
pub struct BuildContext {
    id_map: BTreeMap<String, u32>,
    dup_map: BTreeMap<String, String>,
}

impl BuildContext {
    /// Allocate each container a uid/gid that can be referenced by name,
    /// starting at 100, in onboot, onshutdown, services order.
    pub fn new(manifest: &Manifest) -> Self {
        let mut id_map = BTreeMap::new();
        let mut id = 100u32;
        for image in manifest
            .onboot
            .iter()
            .chain(manifest.onshutdown.iter())
            .chain(manifest.services.iter())
        {
            id_map.insert(image.name.clone(), id);
            id += 1;
        }
        BuildContext {
            id_map,
            dup_map: BTreeMap::new(),
        }
    }

    pub fn id_map(&self) -> &BTreeMap<String, u32> {
        &self.id_map
    }
}

/// Build the system archive for `manifest` into `writer`.
pub fn build<W: Write>(
    manifest: &Manifest,
    registry: &dyn Registry,
    platform: &Platform,
    mut opts: BuildOpts,
    writer: W,
) -> Result<()> {
    // prior-archive metadata records canonical image strings; canonicalize
    // up front so unchanged units compare equal to it
    let manifest = &manifest.canonicalized();

    // the last metadata file is where a prior build recorded its manifest
    let metadata_location = manifest
        .files
        .iter()
        .filter(|f| f.metadata.is_some())
        .next_back()
        .map(|f| f.path.trim_start_matches('/').to_string());

    let mut input = opts.input_tar.take();
    let old_config = match (&metadata_location, input.as_mut()) {
        (Some(location), Some(input)) => read_prior_manifest(input.as_mut(), location)?,
        _ => None,
    };

    let mut ctx = BuildContext::new(manifest);
    let mut sink = TarSink::new(writer);

    if let Some(kernel_ref) = manifest.kernel.reference() {
        let kernel_unchanged = old_config
            .as_ref()
            .map(|c| c.kernel == manifest.kernel)
            .unwrap_or(false);
        if kernel_unchanged {
            let input = input.as_mut().expect("prior config implies prior archive");
            extract_prior_entries(
                input.as_mut(),
                &mut sink,
                &kernel_ref.to_string(),
                KERNEL_LOCATION,
            )?;
        } else {
            tracing::info!(%kernel_ref, "extracting kernel image");
            let image = registry.pull(kernel_ref, platform)?;
            let kernel = &manifest.kernel;
            let mut filter = KernelFilter::new(
                &mut sink,
                kernel_ref.to_string(),
                &kernel.cmdline,
                kernel.binary.as_deref(),
                kernel.tar.as_deref(),
                kernel.ucode.as_deref(),
                opts.decompress_kernel,
            );
            image_tar(KERNEL_LOCATION, kernel_ref, "", &mut filter, None, image.as_ref())?;
            filter.finish()?;
        }
    }

    {
        let mut apk = ApkDbMerger::new(&mut sink, "init");
        let no_old_init: &[_] = &[];
        let old_init = old_config
            .as_ref()
            .map(|c| c.init_refs())
            .unwrap_or(no_old_init);
        let mut reused_init = false;
        for (i, init_ref) in manifest.init_refs().iter().enumerate() {
            let location = format!("init[{i}]");
            if old_init.get(i) == Some(init_ref) {
                reused_init = true;
                let input = input.as_mut().expect("prior config implies prior archive");
                extract_prior_entries(
                    input.as_mut(),
                    &mut apk,
                    &init_ref.to_string(),
                    &location,
                )?;
            } else {
                tracing::info!(%init_ref, "adding init image");
                let image = registry.pull(init_ref, platform)?;
                image_tar(
                    &location,
                    init_ref,
                    "",
                    &mut apk,
                    Some(RESOLVCONF_SYMLINK),
                    image.as_ref(),
                )?;
            }
        }
        if reused_init {
            // the prior archive only carries the merged package database;
            // route it back through the merger so it recombines with any
            // freshly extracted init images
            let input = input.as_mut().expect("prior config implies prior archive");
            extract_prior_entries(input.as_mut(), &mut apk, APK_DB_SOURCE, "init")?;
        }
        apk.finish()?;
    }

    for (i, volume) in manifest.volumes.iter().enumerate() {
        let location = format!("volumes[{i}]");
        let old_volume = old_config.as_ref().and_then(|c| c.volumes.get(i));
        if let Some(volume_ref) = volume.reference() {
            if old_volume == Some(volume) {
                let input = input.as_mut().expect("prior config implies prior archive");
                extract_prior_entries(
                    input.as_mut(),
                    &mut sink,
                    &volume_ref.to_string(),
                    &location,
                )?;
                continue;
            }
        }
        tracing::info!(volume = volume.name, "adding volume");
        write_volume(volume, &location, &mut sink, registry, platform)?;
    }

    for (i, image) in manifest.onboot.iter().enumerate() {
        if old_config
            .as_ref()
            .map(|c| c.onboot.get(i) == Some(image))
            .unwrap_or(false)
        {
            let input = input.as_mut().expect("prior config implies prior archive");
            extract_prior_entries(
                input.as_mut(),
                &mut sink,
                &image.reference().to_string(),
                &format!("onboot[{i}]"),
            )?;
        } else {
            let prefix = format!("{i:03}-");
            output_image(
                image, "onboot", i, &prefix, manifest, &mut ctx, &mut sink, registry, platform,
            )?;
        }
    }

    for (i, image) in manifest.onshutdown.iter().enumerate() {
        if old_config
            .as_ref()
            .map(|c| c.onshutdown.get(i) == Some(image))
            .unwrap_or(false)
        {
            let input = input.as_mut().expect("prior config implies prior archive");
            extract_prior_entries(
                input.as_mut(),
                &mut sink,
                &image.reference().to_string(),
                &format!("onshutdown[{i}]"),
            )?;
        } else {
            let prefix = format!("{i:03}-");
            output_image(
                image,
                "onshutdown",
                i,
                &prefix,
                manifest,
                &mut ctx,
                &mut sink,
                registry,
                platform,
            )?;
        }
    }

    for (i, image) in manifest.services.iter().enumerate() {
        if old_config
            .as_ref()
            .map(|c| c.services.get(i) == Some(image))
            .unwrap_or(false)
        {
            let input = input.as_mut().expect("prior config implies prior archive");
            extract_prior_entries(
                input.as_mut(),
                &mut sink,
                &image.reference().to_string(),
                &format!("services[{i}]"),
            )?;
        } else {
            output_image(
                image, "services", i, "", manifest, &mut ctx, &mut sink, registry, platform,
            )?;
        }
    }

    write_files(manifest, &mut sink, &ctx)?;

    sink.finish()
}

/// Compile one container unit and write its bundle.
#[allow(clippy::too_many_arguments)]
fn output_image(
    image: &Image,
    section: &str,
    index: usize,
    prefix: &str,
    manifest: &Manifest,
    ctx: &mut BuildContext,
    sink: &mut dyn ArchiveSink,
    registry: &dyn Registry,
    platform: &Platform,
) -> Result<()> {
    tracing::info!(name = image.name, image = image.image, section, "adding container");
    let src = registry.pull(image.reference(), platform)?;
    let defaults = src
        .config()
        .with_context(|| format!("failed to retrieve config for {}", image.image))?;
    let resolved = resolve_volume_binds(image, &manifest.volumes)?;
    let (spec, runtime) = compile(&resolved, &defaults, &ctx.id_map)
        .with_context(|| format!("failed to create container config for {}", image.image))?;
    let path = format!("containers/{section}/{prefix}{}", image.name);
    let location = format!("{section}[{index}]");
    crate::bundle::image_bundle(
        &path,
        &location,
        image.reference(),
        src.as_ref(),
        &spec,
        &runtime,
        sink,
        &mut ctx.dup_map,
    )
    .with_context(|| format!("failed to assemble bundle for {}", image.image))
}

/// Rewrite binds and mounts that name a volume instead of an absolute path,
/// pointing them at the volume's merged directory. A read-only volume forces
/// the `ro` option onto anything bound from it.
fn resolve_volume_binds(image: &Image, volumes: &[Volume]) -> Result<Image> {
    let by_name: BTreeMap<&str, &Volume> =
        volumes.iter().map(|v| (v.name.as_str(), v)).collect();
    let mut image = image.clone();

    if let Some(binds) = image.config.binds.as_mut() {
        for bind in binds.iter_mut() {
            let mut parts: Vec<&str> = bind.split(':').collect();
            if parts.is_empty() || parts[0].starts_with('/') {
                continue;
            }
            let Some(volume) = by_name.get(parts[0]) else {
                bail!("container {} bind mounts unknown volume {}", image.name, parts[0]);
            };
            let merged = volume.merged_dir();
            parts[0] = &merged;
            let mut rewritten = parts.join(":");
            if volume.readonly && !parts.get(2).map(|o| o.contains("ro")).unwrap_or(false) {
                rewritten = match parts.len() {
                    2 => format!("{rewritten}:ro"),
                    _ => format!("{rewritten},ro"),
                };
            }
            *bind = rewritten;
        }
    }

    if let Some(mounts) = image.config.mounts.as_mut() {
        for mount in mounts.iter_mut() {
            if mount.source.is_empty() || mount.source.starts_with('/') {
                continue;
            }
            let Some(volume) = by_name.get(mount.source.as_str()) else {
                bail!(
                    "container {} mounts unknown volume {}",
                    image.name,
                    mount.source
                );
            };
            mount.source = volume.merged_dir();
            if mount.mount_type.is_empty() {
                mount.mount_type = "bind".to_string();
            }
            if volume.readonly && !mount.options.iter().any(|o| o == "ro") {
                mount.options.push("ro".to_string());
            }
        }
    }

    Ok(image)
}

/// Write one volume: the populated lower layer plus empty tmp and merged
/// directories the init process overlays at boot.
fn write_volume(
    volume: &Volume,
    location: &str,
    sink: &mut dyn ArchiveSink,
    registry: &dyn Registry,
    platform: &Platform,
) -> Result<()> {
    let lower_prefix = format!("{}/", volume.lower_dir().trim_start_matches('/'));
    match (volume.reference(), volume.format) {
        (None, _) => {
            // an empty volume still needs its lower directory
            tar_prefix(&lower_prefix, location, VOLUME_SOURCE, sink)?;
        }
        (Some(volume_ref), VolumeFormat::Filesystem) => {
            let image = registry.pull(volume_ref, platform)?;
            image_tar(location, volume_ref, &lower_prefix, sink, None, image.as_ref())?;
        }
        (Some(volume_ref), VolumeFormat::Oci) => {
            let image = registry.pull(volume_ref, platform)?;
            let source = volume_ref.to_string();
            tar_prefix(&lower_prefix, location, &source, sink)?;
            append_tar(location, &source, &lower_prefix, sink, image.oci_layout_tar()?)?;
        }
    }

    let provenance = Provenance::new(VOLUME_SOURCE, location);
    for dir in [volume.tmp_dir(), volume.merged_dir()] {
        write_empty(
            sink,
            ArchiveEntry::dir(dir.trim_start_matches('/'), 0o755).with_provenance(&provenance),
        )?;
    }
    Ok(())
}

/// Serialize the canonicalized manifest for a `metadata:` file entry.
fn metadata(manifest: &Manifest, format: MetadataFormat) -> Result<Vec<u8>> {
    let canonical = manifest.canonicalized();
    match format {
        MetadataFormat::Json => {
            serde_json::to_vec_pretty(&canonical).context("serializing manifest metadata")
        }
        MetadataFormat::Yaml => Ok(serde_yaml::to_string(&canonical)
            .context("serializing manifest metadata")?
            .into_bytes()),
    }
}

fn file_contents(file: &File, manifest: &Manifest) -> Result<Option<Vec<u8>>> {
    if let Some(contents) = &file.contents {
        if file.metadata.is_some() {
            bail!("specified contents and metadata for file: {}", file.path);
        }
        if file.source.is_some() {
            bail!("specified contents and source for file: {}", file.path);
        }
        return Ok(Some(contents.clone().into_bytes()));
    }
    if file.directory || file.symlink.is_some() {
        if file.metadata.is_some() {
            bail!("specified contents and metadata for file: {}", file.path);
        }
        if file.source.is_some() {
            bail!("specified contents and source for file: {}", file.path);
        }
        return Ok(Some(Vec::new()));
    }
    match (&file.source, file.metadata) {
        (Some(_), Some(_)) => bail!("specified source and metadata for file: {}", file.path),
        (None, None) => bail!("contents of file ({}) not specified", file.path),
        (Some(source), None) => {
            let mut source = source.clone();
            if let Some(rest) = source.strip_prefix("~/") {
                let home = dirs::home_dir()
                    .ok_or_else(|| BuildError::Validation("home directory not found".into()))?;
                source = home.join(rest).to_string_lossy().into_owned();
            }
            if file.optional && std::fs::metadata(&source).is_err() {
                tracing::debug!(source, "skipping optional file");
                return Ok(None);
            }
            Ok(Some(std::fs::read(&source).with_context(|| {
                format!("reading file source {source}")
            })?))
        }
        (None, Some(format)) => Ok(Some(metadata(manifest, format)?)),
    }
}

/// Write the manifest `files:` section: parent directories are synthesized
/// once each, with execute bits propagated from the file mode per triad.
fn write_files(manifest: &Manifest, sink: &mut dyn ArchiveSink, ctx: &BuildContext) -> Result<()> {
    let mut added: BTreeSet<String> = BTreeSet::new();

    for (i, file) in manifest.files.iter().enumerate() {
        tracing::info!(path = file.path, "adding file");
        if file.path.is_empty() {
            bail!("did not specify path for file");
        }
        // archives must not carry absolute paths
        let path = file.path.trim_start_matches('/').to_string();

        let mut mode: u32 = if file.directory { 0o700 } else { 0o600 };
        if let Some(m) = &file.mode {
            mode = u32::from_str_radix(m, 8)
                .map_err(|_| BuildError::Validation(format!("cannot parse file mode: {m}")))?;
        }
        let mut dir_mode = mode;
        if dir_mode & 0o700 != 0 {
            dir_mode |= 0o100;
        }
        if dir_mode & 0o070 != 0 {
            dir_mode |= 0o010;
        }
        if dir_mode & 0o007 != 0 {
            dir_mode |= 0o001;
        }

        let uid = id_numeric(file.uid.as_ref(), &ctx.id_map)?;
        let gid = id_numeric(file.gid.as_ref(), &ctx.id_map)?;

        let Some(contents) = file_contents(file, manifest)? else {
            continue;
        };

        let provenance = Provenance::new(FILES_SOURCE, format!("files[{i}]"));

        // all leading directories, once each
        let mut parent = String::new();
        for part in path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("").split('/') {
            if part.is_empty() {
                continue;
            }
            if !parent.is_empty() {
                parent.push('/');
            }
            parent.push_str(part);
            if added.insert(parent.clone()) {
                write_empty(
                    sink,
                    ArchiveEntry::dir(&parent, dir_mode)
                        .with_owner(uid.into(), gid.into())
                        .with_provenance(&provenance),
                )?;
            }
        }
        added.insert(path.clone());

        if file.directory {
            if file.contents.is_some() {
                bail!("directory with contents not allowed: {}", file.path);
            }
            write_empty(
                sink,
                ArchiveEntry::dir(&path, mode)
                    .with_owner(uid.into(), gid.into())
                    .with_provenance(&provenance),
            )?;
        } else if let Some(target) = &file.symlink {
            write_empty(
                sink,
                ArchiveEntry::symlink(&path, target)
                    .with_mode(mode)
                    .with_owner(uid.into(), gid.into())
                    .with_provenance(&provenance),
            )?;
        } else {
            write_bytes(
                sink,
                ArchiveEntry::file(&path, mode, 0)
                    .with_owner(uid.into(), gid.into())
                    .with_provenance(&provenance),
                &contents,
            )?;
        }
    }
    Ok(())
}

/// Find and parse the manifest a prior build recorded at `location`.
fn read_prior_manifest(
    input: &mut dyn InputArchive,
    location: &str,
) -> Result<Option<Manifest>> {
    input.seek(SeekFrom::Start(0))?;
    let mut archive = tar::Archive::new(input);
    for entry in archive.entries().context("reading prior archive")? {
        let mut entry = entry.context("reading prior archive entry")?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if path.trim_start_matches('/') != location {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        let manifest =
            Manifest::from_bytes(&buf).context("invalid config in prior archive")?;
        return Ok(Some(manifest));
    }
    Ok(None)
}

/// Copy every entry of the prior archive whose provenance matches both the
/// source and the location, preserving headers and content.
fn extract_prior_entries(
    input: &mut dyn InputArchive,
    sink: &mut dyn ArchiveSink,
    source: &str,
    location: &str,
) -> Result<()> {
    tracing::info!(source, location, "reusing entries from prior archive");
    input.seek(SeekFrom::Start(0))?;
    let mut archive = tar::Archive::new(input);
    for entry in archive.entries().context("reading prior archive")? {
        let mut entry = entry.context("reading prior archive entry")?;
        let Some(provenance) = read_provenance(&mut entry)? else {
            io::copy(&mut entry, &mut io::sink())?;
            continue;
        };
        if provenance.source != source || provenance.location != location {
            io::copy(&mut entry, &mut io::sink())?;
            continue;
        }
        let out = ArchiveEntry {
            header: entry.header().clone(),
            path: entry.path()?.to_string_lossy().into_owned(),
            link_target: entry
                .link_name()?
                .map(|l| l.to_string_lossy().into_owned()),
            provenance: Some(provenance),
        };
        sink.write_entry(out, &mut entry)?;
    }
    Ok(())
}

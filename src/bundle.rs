//! OCI bundle assembly.
//!
//! Each container unit lands in the archive as an OCI bundle: the image's
//! root filesystem plus `config.json` (the compiled OCI spec) and
//! `runtime.json` (init-interpreted extras). Read-only units get a plain
//! `rootfs/`; writable units get a `lower/` layer with overlay mounts the
//! init process assembles at boot. Units sharing an image share one
//! extraction, tracked through the dedup map.

use anyhow::{Context, Result};
use std::collections::BTreeMap;

use crate::archive::{write_bytes, write_empty, ArchiveEntry, ArchiveSink, Provenance};
use crate::image::{image_tar, tar_prefix};
use crate::manifest::Runtime;
use crate::oci::{Mount, Spec};
use crate::reference::ImageRef;
use crate::registry::ImageSource;

/// Write one container unit's OCI bundle at `prefix` (for example
/// `containers/onboot/002-dhcpcd`).
///
/// `dup_map` maps an image reference to the path its filesystem was first
/// extracted to; later units with the same reference mount that path
/// instead of extracting again.
#[allow(clippy::too_many_arguments)]
pub fn image_bundle(
    prefix: &str,
    location: &str,
    reference: &ImageRef,
    image: &dyn ImageSource,
    spec: &Spec,
    runtime: &Runtime,
    sink: &mut dyn ArchiveSink,
    dup_map: &mut BTreeMap<String, String>,
) -> Result<()> {
    let readonly = spec.root.readonly;
    let source = reference.to_string();
    let provenance = Provenance::new(&source, location);

    // read-only bundles extract straight into rootfs/, writable ones into
    // the overlay lower layer
    let root_extract = if readonly { "rootfs" } else { "lower" };
    let mut root = format!("{prefix}/{root_extract}");

    match dup_map.get(&source) {
        None => {
            image_tar(location, reference, &format!("{root}/"), sink, None, image)?;
            dup_map.insert(source.clone(), root.clone());
        }
        Some(existing) => {
            tracing::debug!(%reference, existing, "sharing extracted filesystem");
            tar_prefix(&format!("{prefix}/"), location, &source, sink)?;
            root = existing.clone();
        }
    }

    let config = serde_json::to_vec_pretty(spec)
        .with_context(|| format!("serializing container config for {reference}"))?;
    write_bytes(
        sink,
        ArchiveEntry::file(format!("{prefix}/config.json"), 0o644, 0)
            .with_provenance(&provenance),
        &config,
    )?;

    let rootfs_mounts = if readonly {
        if root != format!("{prefix}/{root_extract}") {
            // shared extraction, so this bundle needs its own mountpoint
            write_empty(
                sink,
                ArchiveEntry::dir(format!("{prefix}/rootfs"), 0o755)
                    .with_provenance(&provenance),
            )?;
        }
        // bind, possibly from self, so runc sees a real mountpoint
        vec![Mount {
            source: format!("/{root}"),
            destination: format!("/{prefix}/rootfs"),
            ..Default::default()
        }
        .with_options(&["bind"])]
    } else {
        // tmp/ holds the tmpfs backing the overlay upper and work dirs
        let tmp = format!("{prefix}/tmp");
        write_empty(
            sink,
            ArchiveEntry::dir(&tmp, 0o755).with_provenance(&provenance),
        )?;
        write_empty(
            sink,
            ArchiveEntry::dir(format!("{prefix}/rootfs"), 0o755).with_provenance(&provenance),
        )?;
        vec![
            Mount {
                source: "tmpfs".to_string(),
                mount_type: "tmpfs".to_string(),
                destination: format!("/{tmp}"),
                ..Default::default()
            },
            // remount private as nothing else should see the temporary layers
            Mount {
                destination: format!("/{tmp}"),
                ..Default::default()
            }
            .with_options(&["remount", "private"]),
            Mount {
                source: "overlay".to_string(),
                mount_type: "overlay".to_string(),
                destination: format!("/{prefix}/rootfs"),
                ..Default::default()
            }
            .with_options(&[
                &format!("lowerdir=/{root}"),
                &format!("upperdir=/{tmp}/upper"),
                &format!("workdir=/{tmp}/work"),
            ]),
        ]
    };

    // the rootfs mounts go first so user mounts can target paths inside it
    let mut runtime = runtime.clone();
    let mut mounts = rootfs_mounts;
    mounts.extend(runtime.mounts.take().unwrap_or_default());
    runtime.mounts = Some(mounts);

    let runtime_config = serde_json::to_vec_pretty(&runtime)
        .with_context(|| format!("serializing runtime config for {reference}"))?;
    write_bytes(
        sink,
        ArchiveEntry::file(format!("{prefix}/runtime.json"), 0o644, 0)
            .with_provenance(&provenance),
        &runtime_config,
    )?;

    Ok(())
}

impl Mount {
    fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }
}

//! The build manifest: typed model, schema validation, reference resolution.
//!
//! A manifest names a kernel image, an ordered list of init images, the
//! onboot/onshutdown/service containers, volumes and literal files. Parsing
//! happens in three steps: the raw YAML/JSON is checked against the schema
//! (collecting every violation), then deserialized into the typed model,
//! then every image string is resolved into a canonical [`ImageRef`].

mod schema;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::BuildError;
use crate::oci::{LinuxIdMapping, LinuxResources, Mount};
use crate::reference::ImageRef;

/// Label under which an image may self-declare its default config.
pub const CONFIG_LABEL: &str = "org.appliance.config";

/// The parsed build manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "KernelConfig::is_empty")]
    pub kernel: KernelConfig,
    #[serde(default)]
    pub init: Vec<String>,
    #[serde(default)]
    pub onboot: Vec<Image>,
    #[serde(default)]
    pub onshutdown: Vec<Image>,
    #[serde(default)]
    pub services: Vec<Image>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default, skip_serializing_if = "TrustConfig::is_empty")]
    pub trust: TrustConfig,

    #[serde(skip)]
    init_refs: Vec<ImageRef>,
}

/// Kernel image configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cmdline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ucode: Option<String>,

    #[serde(skip)]
    reference: Option<ImageRef>,
}

impl KernelConfig {
    fn is_empty(&self) -> bool {
        self.image.is_none()
    }

    /// Resolved kernel image reference; `None` when no kernel is configured.
    pub fn reference(&self) -> Option<&ImageRef> {
        self.reference.as_ref()
    }
}

/// Content trust policy, carried for the notary collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub org: Vec<String>,
}

impl TrustConfig {
    fn is_empty(&self) -> bool {
        self.image.is_empty() && self.org.is_empty()
    }
}

/// A uid or gid: either a literal number or a symbolic name resolved against
/// the per-build name→id map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Number(u32),
    Name(String),
}

/// One container entry in the onboot/onshutdown/services lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub image: String,
    #[serde(flatten)]
    pub config: ImageConfig,

    #[serde(skip)]
    reference: Option<ImageRef>,
}

impl Image {
    /// Resolved image reference.
    ///
    /// # Panics
    /// If called before the owning manifest resolved its references.
    pub fn reference(&self) -> &ImageRef {
        self.reference
            .as_ref()
            .expect("image reference not resolved")
    }
}

/// Per-image configuration. This is the subset valid in the
/// `org.appliance.config` image label; every field is optional so that a
/// field left unset at a higher precedence layer falls through to the next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ambient: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<Mount>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binds: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmpfs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masked_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<IdValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<IdValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_gids: Option<Vec<IdValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_new_privileges: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oom_score_adj: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs_propagation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<LinuxResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sysctl: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rlimits: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid_mappings: Option<Vec<LinuxIdMapping>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid_mappings: Option<Vec<LinuxIdMapping>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<Runtime>,
}

impl ImageConfig {
    /// Parse the value of an `org.appliance.config` image label. The same
    /// schema as a manifest service entry applies, except that `name` and
    /// `image` must not be set inside a label.
    pub fn from_label(label: &str) -> Result<ImageConfig> {
        tracing::debug!(label, "reading image config label");
        let value: serde_yaml::Value =
            serde_yaml::from_str(label).context("parsing image config label")?;
        let violations = schema::check_label(&value);
        if !violations.is_empty() {
            return Err(BuildError::Schema { violations }.into());
        }
        let config: ImageConfig =
            serde_yaml::from_value(value).context("parsing image config label")?;
        Ok(config)
    }
}

/// Config interpreted by the init process at container start rather than by
/// the container runtime; excluded from the OCI spec and written to
/// `runtime.json` instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroups: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounts: Option<Vec<Mount>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mkdir: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    #[serde(default, rename = "bindNS", skip_serializing_if = "Namespaces::is_empty")]
    pub bind_ns: Namespaces,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Paths to bind namespaces into, per namespace kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Namespaces {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mnt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uts: Option<String>,
}

impl Namespaces {
    fn is_empty(&self) -> bool {
        self == &Namespaces::default()
    }
}

/// Runtime network interface operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interface {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub add: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer: String,
    #[serde(default)]
    pub create_in_root: bool,
}

/// Backing format of a volume image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    /// Flattened root filesystem tar.
    #[default]
    Filesystem,
    /// OCI image layout.
    Oci,
}

/// A shared volume, optionally populated from an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default, skip_serializing_if = "is_default_format")]
    pub format: VolumeFormat,

    #[serde(skip)]
    reference: Option<ImageRef>,
}

fn is_default_format(f: &VolumeFormat) -> bool {
    *f == VolumeFormat::Filesystem
}

impl Volume {
    /// Read-only lower layer path.
    pub fn lower_dir(&self) -> String {
        format!("/var/lib/volumes/{}/lower", self.name)
    }

    /// Scratch layer used for the overlay upper/work directories.
    pub fn tmp_dir(&self) -> String {
        format!("/var/lib/volumes/{}/tmp", self.name)
    }

    /// The merged mount point containers bind.
    pub fn merged_dir(&self) -> String {
        format!("/var/lib/volumes/{}/merged", self.name)
    }

    /// Resolved backing image reference, if any.
    pub fn reference(&self) -> Option<&ImageRef> {
        self.reference.as_ref()
    }
}

/// How the generated metadata blob of a [`File`] is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataFormat {
    Json,
    Yaml,
}

/// A literal file entry. Exactly one content source among `contents`,
/// `source`, `metadata`, `symlink` and `directory` must be given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub path: String,
    #[serde(default)]
    pub directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symlink: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataFormat>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<IdValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<IdValue>,
}

impl Manifest {
    /// Parse manifest bytes: schema-validate, deserialize, resolve every
    /// image reference.
    pub fn from_bytes(bytes: &[u8]) -> Result<Manifest> {
        let value: serde_yaml::Value = serde_yaml::from_slice(bytes).context("parsing manifest")?;
        let violations = schema::check_manifest(&value);
        if !violations.is_empty() {
            return Err(BuildError::Schema { violations }.into());
        }
        let mut manifest: Manifest =
            serde_yaml::from_value(value).context("deserializing manifest")?;
        manifest.check_unique_names()?;
        manifest.resolve_references()?;
        Ok(manifest)
    }

    /// Append another manifest onto this one: kernel fields override when
    /// set, the container and file lists concatenate.
    pub fn merge(mut self, other: Manifest) -> Result<Manifest> {
        if other.kernel.image.is_some() {
            self.kernel.image = other.kernel.image;
            self.kernel.reference = other.kernel.reference;
        }
        if !other.kernel.cmdline.is_empty() {
            self.kernel.cmdline = other.kernel.cmdline;
        }
        if other.kernel.binary.is_some() {
            self.kernel.binary = other.kernel.binary;
        }
        if other.kernel.tar.is_some() {
            self.kernel.tar = other.kernel.tar;
        }
        if other.kernel.ucode.is_some() {
            self.kernel.ucode = other.kernel.ucode;
        }
        self.init.extend(other.init);
        self.init_refs.extend(other.init_refs);
        self.onboot.extend(other.onboot);
        self.onshutdown.extend(other.onshutdown);
        self.services.extend(other.services);
        self.volumes.extend(other.volumes);
        self.files.extend(other.files);
        self.trust.image.extend(other.trust.image);
        self.trust.org.extend(other.trust.org);
        self.check_unique_names()?;
        Ok(self)
    }

    /// Resolved init image references, in declaration order.
    pub fn init_refs(&self) -> &[ImageRef] {
        &self.init_refs
    }

    // Container names must be unique within each list; they become archive
    // paths and id-map keys. The same name in different lists is fine.
    fn check_unique_names(&self) -> Result<()> {
        for (section, images) in [
            ("onboot", &self.onboot),
            ("onshutdown", &self.onshutdown),
            ("services", &self.services),
        ] {
            let mut seen = BTreeSet::new();
            for image in images {
                if !seen.insert(image.name.as_str()) {
                    return Err(BuildError::Validation(format!(
                        "duplicate {section} name: {}",
                        image.name
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    fn resolve_references(&mut self) -> Result<()> {
        if let Some(image) = &self.kernel.image {
            self.kernel.reference =
                Some(ImageRef::parse(image).context("resolving kernel image reference")?);
        }
        self.init_refs = self
            .init
            .iter()
            .map(|i| ImageRef::parse(i).context("resolving init image reference"))
            .collect::<Result<_>>()?;
        for (section, images) in [
            ("onboot", &mut self.onboot),
            ("onshutdown", &mut self.onshutdown),
            ("services", &mut self.services),
        ] {
            for image in images.iter_mut() {
                image.reference = Some(
                    ImageRef::parse(&image.image)
                        .with_context(|| format!("resolving {section} image reference"))?,
                );
            }
        }
        for volume in &mut self.volumes {
            if let Some(image) = &volume.image {
                volume.reference = Some(
                    ImageRef::parse(image).context("resolving volume image reference")?,
                );
            }
        }
        Ok(())
    }

    /// Rewrite every image string to its canonical resolved form, so
    /// metadata blobs record exactly what was built.
    pub fn canonicalized(&self) -> Manifest {
        let mut m = self.clone();
        if let Some(r) = &m.kernel.reference {
            m.kernel.image = Some(r.to_string());
        }
        for (i, r) in m.init_refs.iter().enumerate() {
            m.init[i] = r.to_string();
        }
        for image in m
            .onboot
            .iter_mut()
            .chain(m.onshutdown.iter_mut())
            .chain(m.services.iter_mut())
        {
            if let Some(r) = &image.reference {
                image.image = r.to_string();
            }
        }
        for volume in &mut m.volumes {
            if let Some(r) = &volume.reference {
                volume.image = Some(r.to_string());
            }
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
kernel:
  image: applianceos/kernel:6.6.13
  cmdline: "console=ttyS0"
init:
  - applianceos/init:v1.0
onboot:
  - name: sysctl
    image: applianceos/sysctl:v1.0
services:
  - name: getty
    image: applianceos/getty:v1.0
    env:
      - INSECURE=true
files:
  - path: etc/issue
    contents: "welcome"
"#;

    #[test]
    fn parses_minimal_manifest() {
        let m = Manifest::from_bytes(MINIMAL.as_bytes()).unwrap();
        assert_eq!(
            m.kernel.reference().unwrap().to_string(),
            "docker.io/applianceos/kernel:6.6.13"
        );
        assert_eq!(m.init_refs().len(), 1);
        assert_eq!(m.onboot[0].name, "sysctl");
        assert_eq!(
            m.services[0].config.env.as_deref(),
            Some(&["INSECURE=true".to_string()][..])
        );
    }

    #[test]
    fn rejects_unknown_keys_with_all_violations() {
        let err = Manifest::from_bytes(
            b"bogus: 1\nservices:\n  - name: a\n    image: i\n    wrong: 2\n",
        )
        .unwrap_err();
        let schema = err.downcast_ref::<BuildError>().unwrap();
        match schema {
            BuildError::Schema { violations } => {
                assert_eq!(violations.len(), 2);
                assert!(violations[0].contains("bogus"));
                assert!(violations[1].contains("wrong"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_duplicate_name_within_list() {
        let err = Manifest::from_bytes(
            b"services:\n  - name: a\n    image: img:tag\n  - name: a\n    image: img:tag\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate services name"));
    }

    #[test]
    fn permits_duplicate_name_across_lists() {
        let m = Manifest::from_bytes(
            b"onboot:\n  - name: a\n    image: img:tag\nservices:\n  - name: a\n    image: img:tag\n",
        )
        .unwrap();
        assert_eq!(m.onboot[0].name, m.services[0].name);
    }

    #[test]
    fn rejects_missing_image() {
        let err = Manifest::from_bytes(b"services:\n  - name: a\n").unwrap_err();
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn label_config_rejects_identity_fields() {
        assert!(ImageConfig::from_label("env:\n  - A=1\n").is_ok());
        assert!(ImageConfig::from_label("name: sneaky\n").is_err());
        assert!(ImageConfig::from_label("image: sneaky\n").is_err());
    }

    #[test]
    fn volume_paths_derive_from_name() {
        let vol = Volume {
            name: "data".to_string(),
            ..Default::default()
        };
        assert_eq!(vol.lower_dir(), "/var/lib/volumes/data/lower");
        assert_eq!(vol.tmp_dir(), "/var/lib/volumes/data/tmp");
        assert_eq!(vol.merged_dir(), "/var/lib/volumes/data/merged");
    }

    #[test]
    fn canonicalized_rewrites_short_references() {
        let m = Manifest::from_bytes(MINIMAL.as_bytes()).unwrap();
        let canon = m.canonicalized();
        assert_eq!(canon.onboot[0].image, "docker.io/applianceos/sysctl:v1.0");
        assert_eq!(canon.init[0], "docker.io/applianceos/init:v1.0");
    }

    #[test]
    fn merge_appends_lists_and_overrides_kernel() {
        let base = Manifest::from_bytes(MINIMAL.as_bytes()).unwrap();
        let extra = Manifest::from_bytes(
            b"kernel:\n  image: applianceos/kernel:6.7\nservices:\n  - name: ntpd\n    image: applianceos/openntpd:v1.0\n",
        )
        .unwrap();
        let merged = base.merge(extra).unwrap();
        assert_eq!(
            merged.kernel.image.as_deref(),
            Some("applianceos/kernel:6.7")
        );
        assert_eq!(merged.services.len(), 2);
    }
}

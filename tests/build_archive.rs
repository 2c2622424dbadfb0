//! End-to-end builds against an in-memory registry.

use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use appliance_builder::archive::read_provenance;
use appliance_builder::build::BuildOpts;
use appliance_builder::oci::Spec;
use appliance_builder::{build, ImageRef, ImageSource, Manifest, Platform, Registry};

struct FakeImage {
    labels: BTreeMap<String, String>,
    entrypoint: Vec<String>,
    rootfs: Vec<u8>,
}

impl ImageSource for FakeImage {
    fn config(&self) -> Result<appliance_builder::registry::ImageDefaults> {
        Ok(appliance_builder::registry::ImageDefaults {
            entrypoint: self.entrypoint.clone(),
            labels: self.labels.clone(),
            ..Default::default()
        })
    }

    fn rootfs_tar(&self) -> Result<Box<dyn Read>> {
        Ok(Box::new(Cursor::new(self.rootfs.clone())))
    }

    fn oci_layout_tar(&self) -> Result<Box<dyn Read>> {
        Ok(Box::new(Cursor::new(self.rootfs.clone())))
    }
}

#[derive(Default)]
struct FakeRegistry {
    images: BTreeMap<String, (Vec<String>, Vec<u8>)>,
    pulls: RefCell<u32>,
}

impl FakeRegistry {
    fn add(&mut self, reference: &str, entrypoint: &[&str], rootfs: Vec<u8>) {
        let canonical = ImageRef::parse(reference).unwrap().to_string();
        self.images.insert(
            canonical,
            (entrypoint.iter().map(|s| s.to_string()).collect(), rootfs),
        );
    }
}

impl Registry for FakeRegistry {
    fn pull(&self, reference: &ImageRef, _: &Platform) -> Result<Box<dyn ImageSource>> {
        *self.pulls.borrow_mut() += 1;
        let (entrypoint, rootfs) = self
            .images
            .get(&reference.to_string())
            .unwrap_or_else(|| panic!("unexpected pull: {reference}"));
        Ok(Box::new(FakeImage {
            labels: BTreeMap::new(),
            entrypoint: entrypoint.clone(),
            rootfs: rootfs.clone(),
        }))
    }
}

fn tar_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(content.len() as u64);
        builder.append_data(&mut header, *path, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

const MANIFEST: &str = r#"
kernel:
  image: applianceos/kernel:6.6
  cmdline: "console=ttyS0"
init:
  - applianceos/init:v1
onboot:
  - name: sysctl
    image: applianceos/sysctl:v1
    readonly: true
services:
  - name: getty
    image: applianceos/getty:v1
    env:
      - INSECURE=true
files:
  - path: etc/issue
    contents: "welcome"
  - path: var/config/manifest.yml
    metadata: yaml
"#;

fn registry() -> FakeRegistry {
    let mut registry = FakeRegistry::default();
    registry.add(
        "applianceos/kernel:6.6",
        &[],
        tar_of(&[
            ("kernel", &gzip(b"vmlinux")),
            ("kernel.tar", &tar_of(&[("lib/modules/6.6/modules.dep", b"dep")])),
        ]),
    );
    registry.add(
        "applianceos/init:v1",
        &[],
        tar_of(&[
            ("sbin/init", b"#!init"),
            ("lib/apk/db/installed", b"P:init-tools\n"),
        ]),
    );
    registry.add("applianceos/sysctl:v1", &["/sbin/sysctl"], tar_of(&[("sbin/sysctl", b"#!")]));
    registry.add("applianceos/getty:v1", &["/sbin/getty"], tar_of(&[("sbin/getty", b"#!")]));
    registry
}

fn entries(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(bytes);
    let mut out = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        out.push((path, content));
    }
    out
}

fn run_build(registry: &FakeRegistry, opts: BuildOpts) -> Vec<u8> {
    let manifest = Manifest::from_bytes(MANIFEST.as_bytes()).unwrap();
    let mut out = Vec::new();
    build(&manifest, registry, &Platform::default(), opts, &mut out).unwrap();
    out
}

#[test]
fn archive_contains_every_manifest_unit() {
    let registry = registry();
    let archive = run_build(&registry, BuildOpts::default());
    let entries = entries(&archive);
    let paths: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();

    // exactly these entries, in this order, and nothing else
    let expected = [
        // kernel
        "boot",
        "boot/cmdline",
        "boot/kernel",
        "lib/modules/6.6/modules.dep",
        // init, with its synthesized boot-critical entries
        "sbin/init",
        "dev",
        "dev/pts",
        "dev/shm",
        "etc",
        "etc/hosts",
        "etc/mtab",
        "etc/resolv.conf",
        "proc",
        "sys",
        // merged package database, written when the init section closes
        "lib/apk/db/installed",
        // numbered read-only onboot bundle
        "containers",
        "containers/onboot",
        "containers/onboot/000-sysctl",
        "containers/onboot/000-sysctl/rootfs",
        "containers/onboot/000-sysctl/rootfs/sbin/sysctl",
        "containers/onboot/000-sysctl/rootfs/dev",
        "containers/onboot/000-sysctl/rootfs/dev/pts",
        "containers/onboot/000-sysctl/rootfs/dev/shm",
        "containers/onboot/000-sysctl/rootfs/etc",
        "containers/onboot/000-sysctl/rootfs/etc/hosts",
        "containers/onboot/000-sysctl/rootfs/etc/mtab",
        "containers/onboot/000-sysctl/rootfs/etc/resolv.conf",
        "containers/onboot/000-sysctl/rootfs/proc",
        "containers/onboot/000-sysctl/rootfs/sys",
        "containers/onboot/000-sysctl/config.json",
        "containers/onboot/000-sysctl/runtime.json",
        // writable service bundle with its overlay scaffolding
        "containers",
        "containers/services",
        "containers/services/getty",
        "containers/services/getty/lower",
        "containers/services/getty/lower/sbin/getty",
        "containers/services/getty/lower/dev",
        "containers/services/getty/lower/dev/pts",
        "containers/services/getty/lower/dev/shm",
        "containers/services/getty/lower/etc",
        "containers/services/getty/lower/etc/hosts",
        "containers/services/getty/lower/etc/mtab",
        "containers/services/getty/lower/etc/resolv.conf",
        "containers/services/getty/lower/proc",
        "containers/services/getty/lower/sys",
        "containers/services/getty/config.json",
        "containers/services/getty/tmp",
        "containers/services/getty/rootfs",
        "containers/services/getty/runtime.json",
        // files, with synthesized parents
        "etc",
        "etc/issue",
        "var",
        "var/config",
        "var/config/manifest.yml",
    ];
    assert_eq!(paths, expected);

    // decompression is off by default
    let kernel = entries.iter().find(|(p, _)| p == "boot/kernel").unwrap();
    assert_eq!(kernel.1, gzip(b"vmlinux"));

    // files and metadata
    let issue = entries.iter().find(|(p, _)| p == "etc/issue").unwrap();
    assert_eq!(issue.1, b"welcome");
    let metadata = entries
        .iter()
        .find(|(p, _)| p == "var/config/manifest.yml")
        .unwrap();
    let recorded = Manifest::from_bytes(&metadata.1).unwrap();
    assert_eq!(recorded.services[0].image, "docker.io/applianceos/getty:v1");
}

#[test]
fn compiled_config_reflects_image_and_manifest() {
    let registry = registry();
    let archive = run_build(&registry, BuildOpts::default());
    let entries = entries(&archive);

    let config = entries
        .iter()
        .find(|(p, _)| p == "containers/services/getty/config.json")
        .unwrap();
    let spec: Spec = serde_json::from_slice(&config.1).unwrap();
    assert_eq!(spec.process.args, ["/sbin/getty"]);
    assert!(spec.process.env.contains(&"INSECURE=true".to_string()));
    assert!(!spec.root.readonly);

    let config = entries
        .iter()
        .find(|(p, _)| p == "containers/onboot/000-sysctl/config.json")
        .unwrap();
    let spec: Spec = serde_json::from_slice(&config.1).unwrap();
    assert!(spec.root.readonly);
}

#[test]
fn every_entry_carries_provenance_or_is_a_file_entry() {
    let registry = registry();
    let archive = run_build(&registry, BuildOpts::default());

    let mut tar = tar::Archive::new(&archive[..]);
    for entry in tar.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let provenance = read_provenance(&mut entry).unwrap();
        assert!(provenance.is_some(), "no provenance on {path}");
    }
}

#[test]
fn unchanged_manifest_rebuilds_without_pulls() {
    let registry = registry();
    let first = run_build(&registry, BuildOpts::default());
    let first_pulls = *registry.pulls.borrow();
    assert!(first_pulls >= 4);

    let second = run_build(
        &registry,
        BuildOpts {
            input_tar: Some(Box::new(Cursor::new(first.clone()))),
            ..Default::default()
        },
    );
    assert_eq!(*registry.pulls.borrow(), first_pulls, "reuse build pulled images");

    let first_paths: Vec<String> = entries(&first).into_iter().map(|(p, _)| p).collect();
    let second_paths: Vec<String> = entries(&second).into_iter().map(|(p, _)| p).collect();
    for path in ["boot/kernel", "sbin/init", "lib/apk/db/installed", "containers/services/getty/config.json"] {
        assert!(second_paths.iter().any(|p| p == path), "missing {path} after reuse");
    }
    assert_eq!(
        first_paths.iter().filter(|p| p.starts_with("containers/")).count(),
        second_paths.iter().filter(|p| p.starts_with("containers/")).count()
    );
}

#[test]
fn changed_unit_is_rebuilt_while_others_are_reused() {
    let mut registry = registry();
    let first = run_build(&registry, BuildOpts::default());
    registry.add("applianceos/getty:v2", &["/sbin/getty"], tar_of(&[("sbin/getty", b"#!v2")]));
    let pulls_before = *registry.pulls.borrow();

    let manifest = Manifest::from_bytes(
        MANIFEST.replace("applianceos/getty:v1", "applianceos/getty:v2").as_bytes(),
    )
    .unwrap();
    let mut out = Vec::new();
    build(
        &manifest,
        &registry,
        &Platform::default(),
        BuildOpts {
            input_tar: Some(Box::new(Cursor::new(first))),
            ..Default::default()
        },
        &mut out,
    )
    .unwrap();

    // only the changed service image is pulled again
    assert_eq!(*registry.pulls.borrow(), pulls_before + 1);
    let paths: Vec<String> = entries(&out).into_iter().map(|(p, _)| p).collect();
    assert!(paths.iter().any(|p| p == "containers/services/getty/lower/sbin/getty"));
    assert!(paths.iter().any(|p| p == "boot/kernel"));
}

//! Build bootable Linux appliance images from a declarative manifest.
//!
//! A manifest names a kernel image, a list of init-layer images, containers
//! to run at boot, shutdown and as services, shared volumes and literal
//! files. The build resolves every image reference, compiles each container
//! entry into an OCI spec, and streams everything into one ordered tar, the
//! *system archive*, that output converters turn into ISOs, raw disks or
//! cloud images.
//!
//! # Architecture
//!
//! ```text
//! manifest  ──►  build::build()
//!                   │
//!                   ├── kernel::KernelFilter ──┐
//!                   ├── archive::ApkDbMerger ──┼──►  archive::TarSink
//!                   ├── bundle::image_bundle ──┘        (PAX provenance)
//!                   └── files / volumes / metadata
//!                                   │
//!                                   ▼
//!                        system archive (tar)
//!                                   │
//!                        output::split_kernel / Converter
//! ```
//!
//! Every archive entry carries two PAX records naming the image it came from
//! and the manifest location that declared it; a later build handed the
//! prior archive copies unchanged units forward instead of pulling and
//! re-extracting them.
//!
//! # Example
//!
//! ```rust,ignore
//! use appliance_builder::{build, BuildOpts, Manifest};
//!
//! let manifest = Manifest::from_bytes(&std::fs::read("appliance.yml")?)?;
//! let out = std::fs::File::create("appliance.tar")?;
//! build(&manifest, &registry, &Default::default(), BuildOpts::default(), out)?;
//! ```

pub mod archive;
pub mod build;
pub mod bundle;
pub mod compile;
pub mod error;
pub mod image;
pub mod kernel;
pub mod manifest;
pub mod oci;
pub mod output;
pub mod reference;
pub mod registry;

pub use build::{build, BuildContext, BuildOpts};
pub use error::BuildError;
pub use manifest::Manifest;
pub use output::{Converter, OutputFormat};
pub use reference::ImageRef;
pub use registry::{ImageSource, Platform, Registry};

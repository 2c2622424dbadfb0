//! Config compiler: three-layer override into an OCI spec plus a runtime doc.
//!
//! For one container the configuration comes from three places, lowest
//! precedence first: the pulled image's baked-in defaults, an optional
//! `org.appliance.config` label on the image, and the manifest entry. The
//! merge is strictly field-by-field: a field left unset at a higher layer
//! falls through to the next one down.

use anyhow::{Context, Result};
use std::collections::BTreeMap;

use crate::error::BuildError;
use crate::manifest::{IdValue, Image, ImageConfig, Namespaces, Runtime};
use crate::oci::{
    self, Linux, LinuxCapabilities, LinuxNamespace, Mount, NamespaceType, PosixRlimit, Process,
    Root, Spec, User,
};
use crate::registry::ImageDefaults;

/// The fixed capability catalog. Anything outside this list is rejected.
pub const ALL_CAPS: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYSLOG",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_WAKE_ALARM",
];

const RLIMIT_NAMES: &[&str] = &[
    "RLIMIT_CPU",
    "RLIMIT_FSIZE",
    "RLIMIT_DATA",
    "RLIMIT_STACK",
    "RLIMIT_CORE",
    "RLIMIT_RSS",
    "RLIMIT_NPROC",
    "RLIMIT_NOFILE",
    "RLIMIT_MEMLOCK",
    "RLIMIT_AS",
    "RLIMIT_LOCKS",
    "RLIMIT_SIGPENDING",
    "RLIMIT_MSGQUEUE",
    "RLIMIT_NICE",
    "RLIMIT_RTPRIO",
    "RLIMIT_RTTIME",
];

/// Last-set-wins across ordered layers, lowest precedence first.
fn layered<'a, T: ?Sized>(layers: [Option<&'a T>; 3]) -> Option<&'a T> {
    layers.into_iter().rev().flatten().next()
}

/// Like [`layered`] but for the fields that never come from image defaults.
fn layered2<'a, T: ?Sized>(label: Option<&'a T>, manifest: Option<&'a T>) -> Option<&'a T> {
    manifest.or(label)
}

fn cloned<T: Clone>(value: Option<&Vec<T>>) -> Vec<T> {
    value.cloned().unwrap_or_default()
}

/// Compile one image's configuration into the OCI spec written to
/// `config.json` and the runtime document written to `runtime.json`.
///
/// `id_map` is the per-build name→id allocation used to resolve symbolic
/// uids/gids.
pub fn compile(
    image: &Image,
    defaults: &ImageDefaults,
    id_map: &BTreeMap<String, u32>,
) -> Result<(Spec, Runtime)> {
    let label = match defaults.labels.get(crate::manifest::CONFIG_LABEL) {
        Some(value) => ImageConfig::from_label(value)
            .with_context(|| format!("invalid config label on {}", image.image))?,
        None => ImageConfig::default(),
    };
    let cfg = &image.config;

    // command, env and cwd commonly come from the image itself
    let image_command: Vec<String> = defaults
        .entrypoint
        .iter()
        .chain(defaults.cmd.iter())
        .cloned()
        .collect();
    let args = layered([
        Some(&image_command),
        label.command.as_ref(),
        cfg.command.as_ref(),
    ])
    .cloned()
    .unwrap_or_default();
    let env = layered([Some(&defaults.env), label.env.as_ref(), cfg.env.as_ref()])
        .cloned()
        .unwrap_or_default();
    // an empty cwd is not allowed in the OCI spec
    let image_cwd = (!defaults.working_dir.is_empty()).then_some(defaults.working_dir.as_str());
    let cwd = layered([image_cwd, label.cwd.as_deref(), cfg.cwd.as_deref()])
        .unwrap_or("/")
        .to_string();

    // everything else only comes from label or manifest
    let readonly = layered2(label.readonly.as_ref(), cfg.readonly.as_ref())
        .copied()
        .unwrap_or(false);

    let mounts = compile_mounts(&label, cfg, readonly)?;
    let namespaces = compile_namespaces(&label, cfg);
    let (bounding, effective, ambient) = compile_capabilities(&label, cfg)?;
    let rlimits = compile_rlimits(&label, cfg)?;

    let uid = id_numeric(layered2(label.uid.as_ref(), cfg.uid.as_ref()), id_map)?;
    let gid = id_numeric(layered2(label.gid.as_ref(), cfg.gid.as_ref()), id_map)?;
    let additional_gids = layered2(label.additional_gids.as_ref(), cfg.additional_gids.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default()
        .iter()
        .map(|id| id_numeric(Some(id), id_map))
        .collect::<Result<Vec<u32>>>()?;

    let spec = Spec {
        oci_version: oci::OCI_VERSION.to_string(),
        process: Process {
            terminal: false,
            user: User {
                uid,
                gid,
                additional_gids,
            },
            args,
            env,
            cwd,
            capabilities: Some(LinuxCapabilities {
                bounding: bounding.clone(),
                effective,
                inheritable: bounding.clone(),
                permitted: bounding,
                ambient,
            }),
            rlimits,
            no_new_privileges: layered2(
                label.no_new_privileges.as_ref(),
                cfg.no_new_privileges.as_ref(),
            )
            .copied()
            .unwrap_or(false),
            oom_score_adj: layered2(label.oom_score_adj.as_ref(), cfg.oom_score_adj.as_ref())
                .copied(),
        },
        root: Root {
            path: "rootfs".to_string(),
            readonly,
        },
        hostname: layered2(label.hostname.as_deref(), cfg.hostname.as_deref())
            .unwrap_or_default()
            .to_string(),
        mounts,
        annotations: layered2(label.annotations.as_ref(), cfg.annotations.as_ref())
            .cloned()
            .unwrap_or_default(),
        linux: Some(Linux {
            uid_mappings: cloned(layered2(
                label.uid_mappings.as_ref(),
                cfg.uid_mappings.as_ref(),
            )),
            gid_mappings: cloned(layered2(
                label.gid_mappings.as_ref(),
                cfg.gid_mappings.as_ref(),
            )),
            sysctl: layered2(label.sysctl.as_ref(), cfg.sysctl.as_ref())
                .cloned()
                .unwrap_or_default(),
            resources: Some(
                layered2(label.resources.as_ref(), cfg.resources.as_ref())
                    .cloned()
                    .unwrap_or_default(),
            ),
            cgroups_path: layered2(label.cgroups_path.as_deref(), cfg.cgroups_path.as_deref())
                .unwrap_or_default()
                .to_string(),
            namespaces,
            rootfs_propagation: layered2(
                label.rootfs_propagation.as_deref(),
                cfg.rootfs_propagation.as_deref(),
            )
            .unwrap_or_default()
            .to_string(),
            masked_paths: cloned(layered2(
                label.masked_paths.as_ref(),
                cfg.masked_paths.as_ref(),
            )),
            readonly_paths: cloned(layered2(
                label.readonly_paths.as_ref(),
                cfg.readonly_paths.as_ref(),
            )),
        }),
    };

    let runtime = compile_runtime(&label, cfg);

    Ok((spec, runtime))
}

fn default_mountpoint(mount_type: &str) -> &'static str {
    match mount_type {
        "proc" => "/proc",
        "devpts" => "/dev/pts",
        "sysfs" => "/sys",
        "cgroup" => "/sys/fs/cgroup",
        "mqueue" => "/dev/mqueue",
        _ => "",
    }
}

fn compile_mounts(label: &ImageConfig, cfg: &ImageConfig, readonly: bool) -> Result<Vec<Mount>> {
    fn opts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    let mut dev_options = opts(&["nosuid", "strictatime", "mode=755", "size=65536k"]);
    let mut sys_options = opts(&["nosuid", "noexec", "nodev"]);
    if readonly {
        dev_options.push("ro".to_string());
        sys_options.push("ro".to_string());
    }

    // note omits "standard" /dev/shm and /dev/mqueue
    let mut mounts: BTreeMap<String, Mount> = BTreeMap::new();
    for (dest, mount_type, source, options) in [
        ("/proc", "proc", "proc", opts(&["nosuid", "nodev", "noexec", "relatime"])),
        ("/dev", "tmpfs", "tmpfs", dev_options),
        (
            "/dev/pts",
            "devpts",
            "devpts",
            opts(&["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"]),
        ),
        ("/sys", "sysfs", "sysfs", sys_options),
        (
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            opts(&["nosuid", "noexec", "nodev", "relatime", "ro"]),
        ),
    ] {
        mounts.insert(
            dest.to_string(),
            Mount {
                destination: dest.to_string(),
                mount_type: mount_type.to_string(),
                source: source.to_string(),
                options,
            },
        );
    }

    for t in layered2(label.tmpfs.as_ref(), cfg.tmpfs.as_ref()).map(Vec::as_slice).unwrap_or_default() {
        let mut parts = t.splitn(3, ':');
        let dest = parts.next().unwrap_or_default().to_string();
        if dest.is_empty() {
            return Err(BuildError::Validation(format!("cannot parse tmpfs: {t}")).into());
        }
        let options: Vec<String> = parts
            .next()
            .map(|o| o.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        if parts.next().is_some() {
            return Err(
                BuildError::Validation(format!("cannot parse tmpfs, too many ':': {t}")).into(),
            );
        }
        mounts.insert(
            dest.clone(),
            Mount {
                destination: dest,
                mount_type: "tmpfs".to_string(),
                source: "tmpfs".to_string(),
                options,
            },
        );
    }

    for b in layered2(label.binds.as_ref(), cfg.binds.as_ref()).map(Vec::as_slice).unwrap_or_default() {
        let parts: Vec<&str> = b.split(':').collect();
        let (src, dest, options) = match parts.as_slice() {
            [src, dest] => (*src, *dest, opts(&["rw", "rbind", "rshared"])),
            [src, dest, bind_opts] => {
                let mut options: Vec<String> =
                    bind_opts.split(',').map(str::to_string).collect();
                options.push("rbind".to_string());
                (*src, *dest, options)
            }
            _ => {
                return Err(BuildError::Validation(format!(
                    "cannot parse bind, expected src:dest[:opts]: {b}"
                ))
                .into())
            }
        };
        mounts.insert(
            dest.to_string(),
            Mount {
                destination: dest.to_string(),
                mount_type: "bind".to_string(),
                source: src.to_string(),
                options,
            },
        );
    }

    for m in layered2(label.mounts.as_ref(), cfg.mounts.as_ref()).map(Vec::as_slice).unwrap_or_default() {
        let mut mount_type = m.mount_type.clone();
        let mut source = m.source.clone();
        let mut dest = m.destination.clone();
        if mount_type.is_empty() {
            match source.as_str() {
                "mqueue" | "devpts" | "proc" | "sysfs" | "cgroup" => mount_type = source.clone(),
                _ => {}
            }
        }
        if mount_type.is_empty() && dest == "/dev" {
            mount_type = "tmpfs".to_string();
        }
        if mount_type.is_empty() {
            return Err(BuildError::Validation(format!(
                "mount for destination {dest} is missing type"
            ))
            .into());
        }
        if source.is_empty() {
            // usually sane, eg proc, tmpfs etc
            source = mount_type.clone();
        }
        if dest.is_empty() {
            dest = default_mountpoint(&mount_type).to_string();
        }
        if dest.is_empty() {
            return Err(BuildError::Validation(format!(
                "mount type {mount_type} is missing destination"
            ))
            .into());
        }
        mounts.insert(
            dest.clone(),
            Mount {
                destination: dest,
                mount_type,
                source,
                options: m.options.clone(),
            },
        );
    }

    // children must sort after their parents so they are mounted later
    let mut list: Vec<Mount> = mounts.into_values().collect();
    list.sort_by_key(|m| path_depth(&m.destination));
    Ok(list)
}

fn path_depth(path: &str) -> usize {
    path.trim_end_matches('/').matches('/').count()
}

fn compile_namespaces(label: &ImageConfig, cfg: &ImageConfig) -> Vec<LinuxNamespace> {
    let mut namespaces = Vec::new();

    // net, ipc, uts and user default to staying in the root namespace; pid
    // defaults to a fresh namespace
    let mut push = |ns_type: NamespaceType, value: &str| {
        if value == "host" || value == "root" {
            return;
        }
        let path = match value {
            "new" | "none" | "" => String::new(),
            bind => bind.to_string(),
        };
        namespaces.push(LinuxNamespace { ns_type, path });
    };

    let pick = |label_v: &Option<String>, cfg_v: &Option<String>, default: &'static str| {
        layered2(label_v.as_deref(), cfg_v.as_deref())
            .unwrap_or(default)
            .to_string()
    };

    push(NamespaceType::Network, &pick(&label.net, &cfg.net, "root"));
    push(NamespaceType::Ipc, &pick(&label.ipc, &cfg.ipc, "root"));
    push(NamespaceType::Uts, &pick(&label.uts, &cfg.uts, "root"));
    push(NamespaceType::Pid, &pick(&label.pid, &cfg.pid, "new"));
    // a user namespace needs additional configuration, never created by default
    push(
        NamespaceType::User,
        &pick(&label.userns, &cfg.userns, "root"),
    );

    // always create a new mount namespace
    namespaces.push(LinuxNamespace {
        ns_type: NamespaceType::Mount,
        path: String::new(),
    });

    namespaces
}

fn expand_caps(mut caps: Vec<String>) -> Vec<String> {
    if caps.len() == 1 {
        match caps[0].to_ascii_lowercase().as_str() {
            "none" => caps = Vec::new(),
            "all" => caps = ALL_CAPS.iter().map(|c| c.to_string()).collect(),
            _ => {}
        }
    }
    caps
}

fn compile_capabilities(
    label: &ImageConfig,
    cfg: &ImageConfig,
) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
    let caps = expand_caps(cloned(layered2(
        label.capabilities.as_ref(),
        cfg.capabilities.as_ref(),
    )));
    let ambient = expand_caps(cloned(layered2(label.ambient.as_ref(), cfg.ambient.as_ref())));

    let mut bounding: Vec<&str> = Vec::new();
    for capability in caps.iter().chain(ambient.iter()) {
        if !ALL_CAPS.contains(&capability.as_str()) {
            return Err(
                BuildError::Validation(format!("unknown capability: {capability}")).into(),
            );
        }
        bounding.push(capability);
    }
    // deterministic bounding set
    bounding.sort_unstable();
    bounding.dedup();

    Ok((
        bounding.into_iter().map(str::to_string).collect(),
        caps,
        ambient,
    ))
}

fn parse_rlimit_value(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("unlimited") {
        return Ok(u64::MAX);
    }
    value
        .parse()
        .map_err(|_| BuildError::Validation(format!("cannot parse {value} as u64")).into())
}

fn compile_rlimits(label: &ImageConfig, cfg: &ImageConfig) -> Result<Vec<PosixRlimit>> {
    let mut rlimits = Vec::new();
    for spec in layered2(label.rlimits.as_ref(), cfg.rlimits.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default()
    {
        let parts: Vec<&str> = spec.splitn(3, ',').collect();
        let [name, soft, hard] = parts.as_slice() else {
            return Err(BuildError::Validation(format!("cannot parse rlimit: {spec}")).into());
        };
        let mut limit_type = name.trim().to_ascii_uppercase();
        if !limit_type.starts_with("RLIMIT_") {
            limit_type = format!("RLIMIT_{limit_type}");
        }
        if !RLIMIT_NAMES.contains(&limit_type.as_str()) {
            return Err(BuildError::Validation(format!("unknown rlimit: {name}")).into());
        }
        rlimits.push(PosixRlimit {
            limit_type,
            soft: parse_rlimit_value(soft)?,
            hard: parse_rlimit_value(hard)?,
        });
    }
    Ok(rlimits)
}

/// Resolve a uid/gid value: a literal number passes through, an empty name
/// or `root` is 0, anything else must be a declared image name.
pub fn id_numeric(value: Option<&IdValue>, id_map: &BTreeMap<String, u32>) -> Result<u32> {
    match value {
        None => Ok(0),
        Some(IdValue::Number(n)) => Ok(*n),
        Some(IdValue::Name(name)) if name.is_empty() || name == "root" => Ok(0),
        Some(IdValue::Name(name)) => id_map
            .get(name)
            .copied()
            .ok_or_else(|| BuildError::UnknownIdentity(name.clone()).into()),
    }
}

fn compile_runtime(label: &ImageConfig, cfg: &ImageConfig) -> Runtime {
    let l = label.runtime.clone().unwrap_or_default();
    let c = cfg.runtime.clone().unwrap_or_default();
    Runtime {
        cgroups: Some(cloned(layered2(l.cgroups.as_ref(), c.cgroups.as_ref()))),
        mounts: Some(cloned(layered2(l.mounts.as_ref(), c.mounts.as_ref()))),
        mkdir: Some(cloned(layered2(l.mkdir.as_ref(), c.mkdir.as_ref()))),
        interfaces: Some(cloned(layered2(
            l.interfaces.as_ref(),
            c.interfaces.as_ref(),
        ))),
        bind_ns: Namespaces {
            cgroup: layered2(l.bind_ns.cgroup.as_ref(), c.bind_ns.cgroup.as_ref()).cloned(),
            ipc: layered2(l.bind_ns.ipc.as_ref(), c.bind_ns.ipc.as_ref()).cloned(),
            mnt: layered2(l.bind_ns.mnt.as_ref(), c.bind_ns.mnt.as_ref()).cloned(),
            net: layered2(l.bind_ns.net.as_ref(), c.bind_ns.net.as_ref()).cloned(),
            pid: layered2(l.bind_ns.pid.as_ref(), c.bind_ns.pid.as_ref()).cloned(),
            user: layered2(l.bind_ns.user.as_ref(), c.bind_ns.user.as_ref()).cloned(),
            uts: layered2(l.bind_ns.uts.as_ref(), c.bind_ns.uts.as_ref()).cloned(),
        },
        namespace: layered2(l.namespace.as_ref(), c.namespace.as_ref()).cloned(),
    }
}

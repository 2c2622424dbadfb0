//! Manifest schema checking.
//!
//! Runs over the raw YAML document before typed deserialization so that
//! every violation is reported at once, with the manifest path
//! (`services[0].capabilities`) each problem was found at. Unknown keys are
//! rejected at every level.

use serde_yaml::Value;

const MANIFEST_KEYS: &[&str] = &[
    "kernel",
    "init",
    "onboot",
    "onshutdown",
    "services",
    "volumes",
    "files",
    "trust",
];

const KERNEL_KEYS: &[&str] = &["image", "cmdline", "binary", "tar", "ucode"];

const CONFIG_KEYS: &[&str] = &[
    "capabilities",
    "ambient",
    "mounts",
    "binds",
    "tmpfs",
    "command",
    "env",
    "cwd",
    "net",
    "pid",
    "ipc",
    "uts",
    "userns",
    "hostname",
    "readonly",
    "maskedPaths",
    "readonlyPaths",
    "uid",
    "gid",
    "additionalGids",
    "noNewPrivileges",
    "oomScoreAdj",
    "rootfsPropagation",
    "cgroupsPath",
    "resources",
    "sysctl",
    "rlimits",
    "uidMappings",
    "gidMappings",
    "annotations",
    "runtime",
];

const RUNTIME_KEYS: &[&str] = &["cgroups", "mounts", "mkdir", "interfaces", "bindNS", "namespace"];

const VOLUME_KEYS: &[&str] = &["name", "image", "readonly", "format"];

const FILE_KEYS: &[&str] = &[
    "path",
    "directory",
    "symlink",
    "contents",
    "source",
    "metadata",
    "optional",
    "mode",
    "uid",
    "gid",
];

const TRUST_KEYS: &[&str] = &["image", "org"];

/// Check a whole manifest document. Returns every violation found.
pub fn check_manifest(value: &Value) -> Vec<String> {
    let mut v = Violations::default();
    let Some(map) = as_mapping(value, "manifest", &mut v) else {
        return v.0;
    };
    for (key, val) in ordered_keys(map, "manifest", MANIFEST_KEYS, &mut v) {
        match key {
            "kernel" => check_kernel(val, &mut v),
            "init" => check_string_list(val, "init", &mut v),
            "onboot" | "onshutdown" | "services" => check_image_list(val, key, &mut v),
            "volumes" => check_volumes(val, &mut v),
            "files" => check_files(val, &mut v),
            "trust" => check_trust(val, &mut v),
            _ => unreachable!(),
        }
    }
    v.0
}

/// Check an image-label config: the per-image keys without `name`/`image`,
/// which a label must not declare.
pub fn check_label(value: &Value) -> Vec<String> {
    let mut v = Violations::default();
    let Some(map) = as_mapping(value, "label", &mut v) else {
        return v.0;
    };
    for (key, val) in map {
        let Some(key) = key.as_str() else {
            v.push("label: non-string key");
            continue;
        };
        match key {
            "name" | "image" => v.push(format!("label: {key} cannot be set in an image label")),
            _ if CONFIG_KEYS.contains(&key) => check_config_field(key, val, "label", &mut v),
            _ => v.push(format!("label: unknown key '{key}'")),
        }
    }
    v.0
}

#[derive(Default)]
struct Violations(Vec<String>);

impl Violations {
    fn push(&mut self, msg: impl Into<String>) {
        self.0.push(msg.into());
    }
}

fn as_mapping<'a>(
    value: &'a Value,
    at: &str,
    v: &mut Violations,
) -> Option<&'a serde_yaml::Mapping> {
    match value {
        Value::Mapping(map) => Some(map),
        Value::Null => None,
        _ => {
            v.push(format!("{at}: expected a mapping"));
            None
        }
    }
}

// Yields known keys in document order; unknown or non-string keys are
// reported as violations.
fn ordered_keys<'a>(
    map: &'a serde_yaml::Mapping,
    at: &str,
    allowed: &'static [&'static str],
    v: &mut Violations,
) -> Vec<(&'static str, &'a Value)> {
    let mut found = Vec::new();
    for (key, val) in map {
        let Some(key) = key.as_str() else {
            v.push(format!("{at}: non-string key"));
            continue;
        };
        match allowed.iter().find(|k| **k == key) {
            Some(known) => found.push((*known, val)),
            None => v.push(format!("{at}: unknown key '{key}'")),
        }
    }
    found
}

fn expect_string(value: &Value, at: &str, v: &mut Violations) {
    if !value.is_string() {
        v.push(format!("{at}: expected a string"));
    }
}

fn expect_bool(value: &Value, at: &str, v: &mut Violations) {
    if !value.is_bool() {
        v.push(format!("{at}: expected a boolean"));
    }
}

fn check_string_list(value: &Value, at: &str, v: &mut Violations) {
    let Some(seq) = value.as_sequence() else {
        v.push(format!("{at}: expected a list"));
        return;
    };
    for (i, item) in seq.iter().enumerate() {
        expect_string(item, &format!("{at}[{i}]"), v);
    }
}

fn check_kernel(value: &Value, v: &mut Violations) {
    let Some(map) = as_mapping(value, "kernel", v) else {
        return;
    };
    for (key, val) in ordered_keys(map, "kernel", KERNEL_KEYS, v) {
        expect_string(val, &format!("kernel.{key}"), v);
    }
}

fn check_image_list(value: &Value, section: &str, v: &mut Violations) {
    let Some(seq) = value.as_sequence() else {
        v.push(format!("{section}: expected a list"));
        return;
    };
    for (i, item) in seq.iter().enumerate() {
        let at = format!("{section}[{i}]");
        let Some(map) = as_mapping(item, &at, v) else {
            continue;
        };
        for required in ["name", "image"] {
            match map.get(required) {
                Some(val) => expect_string(val, &format!("{at}.{required}"), v),
                None => v.push(format!("{at}: missing required key '{required}'")),
            }
        }
        for (key, val) in map {
            let Some(key) = key.as_str() else {
                v.push(format!("{at}: non-string key"));
                continue;
            };
            match key {
                "name" | "image" => {}
                _ if CONFIG_KEYS.contains(&key) => check_config_field(key, val, &at, v),
                _ => v.push(format!("{at}: unknown key '{key}'")),
            }
        }
    }
}

// Shallow type checks for per-image config fields; the typed deserializer
// catches anything structural inside mounts/resources/mappings.
fn check_config_field(key: &str, value: &Value, at: &str, v: &mut Violations) {
    let at = format!("{at}.{key}");
    match key {
        "capabilities" | "ambient" | "binds" | "tmpfs" | "command" | "env" | "maskedPaths"
        | "readonlyPaths" | "rlimits" => check_string_list(value, &at, v),
        "cwd" | "net" | "pid" | "ipc" | "uts" | "userns" | "hostname" | "rootfsPropagation"
        | "cgroupsPath" => expect_string(value, &at, v),
        "readonly" | "noNewPrivileges" => expect_bool(value, &at, v),
        "oomScoreAdj" => {
            if !value.is_i64() {
                v.push(format!("{at}: expected an integer"));
            }
        }
        "uid" | "gid" => check_id(value, &at, v),
        "additionalGids" => {
            if let Some(seq) = value.as_sequence() {
                for (i, item) in seq.iter().enumerate() {
                    check_id(item, &format!("{at}[{i}]"), v);
                }
            } else {
                v.push(format!("{at}: expected a list"));
            }
        }
        "runtime" => check_runtime(value, &at, v),
        "mounts" | "resources" | "sysctl" | "uidMappings" | "gidMappings" | "annotations" => {
            if !value.is_mapping() && !value.is_sequence() {
                v.push(format!("{at}: expected a mapping or list"));
            }
        }
        _ => {}
    }
}

fn check_id(value: &Value, at: &str, v: &mut Violations) {
    if !value.is_u64() && !value.is_string() {
        v.push(format!("{at}: expected an integer or a name"));
    }
}

fn check_runtime(value: &Value, at: &str, v: &mut Violations) {
    let Some(map) = as_mapping(value, at, v) else {
        return;
    };
    for (key, val) in ordered_keys(map, at, RUNTIME_KEYS, v) {
        match key {
            "cgroups" | "mkdir" => check_string_list(val, &format!("{at}.{key}"), v),
            "namespace" => expect_string(val, &format!("{at}.{key}"), v),
            _ => {}
        }
    }
}

fn check_volumes(value: &Value, v: &mut Violations) {
    let Some(seq) = value.as_sequence() else {
        v.push("volumes: expected a list".to_string());
        return;
    };
    for (i, item) in seq.iter().enumerate() {
        let at = format!("volumes[{i}]");
        let Some(map) = as_mapping(item, &at, v) else {
            continue;
        };
        if map.get("name").is_none() {
            v.push(format!("{at}: missing required key 'name'"));
        }
        for (key, val) in ordered_keys(map, &at, VOLUME_KEYS, v) {
            match key {
                "name" | "image" => expect_string(val, &format!("{at}.{key}"), v),
                "readonly" => expect_bool(val, &format!("{at}.{key}"), v),
                "format" => {
                    if !matches!(val.as_str(), Some("filesystem") | Some("oci")) {
                        v.push(format!("{at}.format: expected 'filesystem' or 'oci'"));
                    }
                }
                _ => unreachable!(),
            }
        }
    }
}

fn check_files(value: &Value, v: &mut Violations) {
    let Some(seq) = value.as_sequence() else {
        v.push("files: expected a list".to_string());
        return;
    };
    for (i, item) in seq.iter().enumerate() {
        let at = format!("files[{i}]");
        let Some(map) = as_mapping(item, &at, v) else {
            continue;
        };
        if map.get("path").is_none() {
            v.push(format!("{at}: missing required key 'path'"));
        }
        for (key, val) in ordered_keys(map, &at, FILE_KEYS, v) {
            match key {
                "path" | "symlink" | "contents" | "source" | "mode" => {
                    expect_string(val, &format!("{at}.{key}"), v)
                }
                "directory" | "optional" => expect_bool(val, &format!("{at}.{key}"), v),
                "metadata" => {
                    if !matches!(val.as_str(), Some("json") | Some("yaml")) {
                        v.push(format!("{at}.metadata: expected 'json' or 'yaml'"));
                    }
                }
                "uid" | "gid" => check_id(val, &format!("{at}.{key}"), v),
                _ => unreachable!(),
            }
        }
    }
}

fn check_trust(value: &Value, v: &mut Violations) {
    let Some(map) = as_mapping(value, "trust", v) else {
        return;
    };
    for (key, val) in ordered_keys(map, "trust", TRUST_KEYS, v) {
        check_string_list(val, &format!("trust.{key}"), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violations(yaml: &str) -> Vec<String> {
        check_manifest(&serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn accepts_well_formed_manifest() {
        let found = violations(
            r#"
kernel:
  image: applianceos/kernel:6.6
services:
  - name: a
    image: img
    capabilities: ["all"]
    runtime:
      mkdir: ["/var/lib/a"]
files:
  - path: etc/issue
    contents: hi
"#,
        );
        assert!(found.is_empty(), "{found:?}");
    }

    #[test]
    fn collects_multiple_violations() {
        let found = violations(
            r#"
mystery: 1
kernel:
  image: k
  extra: true
services:
  - image: 7
"#,
        );
        assert_eq!(found.len(), 4, "{found:?}");
        assert!(found.iter().any(|m| m.contains("unknown key 'mystery'")));
        assert!(found.iter().any(|m| m.contains("unknown key 'extra'")));
        assert!(found.iter().any(|m| m.contains("missing required key 'name'")));
        assert!(found
            .iter()
            .any(|m| m.contains("services[0].image: expected a string")));
    }

    #[test]
    fn type_checks_config_fields() {
        let found = violations(
            r#"
services:
  - name: a
    image: i
    readonly: "yes"
    capabilities: all
    oomScoreAdj: low
"#,
        );
        assert_eq!(found.len(), 3, "{found:?}");
    }

    #[test]
    fn label_rejects_identity() {
        let value = serde_yaml::from_str("name: x\nenv: [A=1]\n").unwrap();
        let found = check_label(&value);
        assert_eq!(found.len(), 1);
        assert!(found[0].contains("cannot be set"));
    }
}

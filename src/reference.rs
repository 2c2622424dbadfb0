//! Registry image reference parsing and normalization.
//!
//! A reference is `[registry/][repository/]name[:tag][@digest]`. Short forms
//! are expanded the way Docker does: a bare `alpine` becomes
//! `docker.io/library/alpine:latest`, `applianceos/init` becomes
//! `docker.io/applianceos/init:latest`. The expanded string is the canonical
//! form used for provenance tags and deduplication keys.

use anyhow::Result;
use std::fmt;

use crate::error::BuildError;

/// A parsed, normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    /// Registry host, e.g. `docker.io`.
    pub registry: String,
    /// Repository path within the registry, e.g. `library/alpine`.
    pub repository: String,
    /// Tag, defaulted to `latest` when neither tag nor digest is given.
    pub tag: Option<String>,
    /// Content digest (`sha256:...`), if pinned.
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse and normalize a reference string.
    pub fn parse(s: &str) -> Result<ImageRef> {
        let fail = |reason: &str| BuildError::Reference {
            reference: s.to_string(),
            reason: reason.to_string(),
        };

        if s.is_empty() {
            return Err(fail("empty reference").into());
        }
        if s.chars().any(char::is_whitespace) {
            return Err(fail("whitespace not allowed").into());
        }

        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => {
                let (algo, hex) = digest
                    .split_once(':')
                    .ok_or_else(|| fail("digest missing algorithm prefix"))?;
                if algo.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit())
                {
                    return Err(fail("malformed digest").into());
                }
                (rest, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A colon after the last slash separates the tag; a colon before it
        // would be a registry port.
        let (name, tag) = match rest.rfind(':') {
            Some(idx) if idx > rest.rfind('/').unwrap_or(0) => {
                let tag = &rest[idx + 1..];
                if tag.is_empty() {
                    return Err(fail("empty tag").into());
                }
                (&rest[..idx], Some(tag.to_string()))
            }
            _ => (rest, None),
        };
        if name.is_empty() {
            return Err(fail("empty name").into());
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "./-_:".contains(c))
        {
            return Err(fail("invalid character in name").into());
        }

        // Decide whether the first component is a registry host: it is if it
        // contains a dot, a port, or is "localhost".
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => ("docker.io".to_string(), name.to_string()),
            None => ("docker.io".to_string(), format!("library/{name}")),
        };
        if repository.is_empty() || repository.ends_with('/') || repository.contains("//") {
            return Err(fail("malformed repository path").into());
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some("latest".to_string()),
            _ => tag,
        };

        Ok(ImageRef {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_bare_name() {
        let r = ImageRef::parse("alpine").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/alpine:latest");
    }

    #[test]
    fn expands_user_repository() {
        let r = ImageRef::parse("applianceos/init:v1.0").unwrap();
        assert_eq!(r.to_string(), "docker.io/applianceos/init:v1.0");
    }

    #[test]
    fn keeps_explicit_registry() {
        let r = ImageRef::parse("ghcr.io/org/img:tag").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/img");
    }

    #[test]
    fn registry_with_port() {
        let r = ImageRef::parse("localhost:5000/img").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.to_string(), "localhost:5000/img:latest");
    }

    #[test]
    fn digest_pinned_reference_gets_no_default_tag() {
        let r = ImageRef::parse("alpine@sha256:0123abcd").unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:0123abcd"));
    }

    #[test]
    fn rejects_malformed() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("has space").is_err());
        assert!(ImageRef::parse("img:").is_err());
        assert!(ImageRef::parse("img@sha256").is_err());
        assert!(ImageRef::parse("UPPER").is_err());
    }
}

//! Prefix rewriting applied to inbound SPARQL/Turtle bodies and outbound
//! result payloads.
//!
//! A [`PrefixRegistry`] holds a set of `tag -> IRI` bindings, loaded once
//! from an optional Turtle prefix file at startup (REQ: §4.1). It never
//! mutates the tree of resources or talks to the backend; it is a pure,
//! in-memory string-rewriting layer shared by every request handler.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PrefixError {
    #[error("prefix '{0}' is already registered")]
    DuplicatePrefix(String),

    #[error("could not read prefix file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// The body formats recognized by the broker's update endpoint.
///
/// `Unknown` is a distinct, first-class variant rather than an error: per
/// the redesign flag in §9, an unrecognized `format=` option value is still
/// forwarded to the backend, which is the component that ultimately
/// produces `UnknownFormat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Sparql,
    Ttl,
    N3,
    Unknown,
}

impl BodyFormat {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sparql" => BodyFormat::Sparql,
            "ttl" => BodyFormat::Ttl,
            "n3" => BodyFormat::N3,
            _ => BodyFormat::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BodyFormat::Sparql => "sparql",
            BodyFormat::Ttl => "ttl",
            BodyFormat::N3 => "n3",
            BodyFormat::Unknown => "unknown",
        }
    }
}

/// Declared prefix bindings plus their two rendered header forms.
pub struct PrefixRegistry {
    bindings: BTreeMap<String, String>,
    sparql_header: String,
    ttl_header: String,
}

impl PrefixRegistry {
    /// A registry with no bindings at all.
    pub fn empty() -> Self {
        Self {
            bindings: BTreeMap::new(),
            sparql_header: String::new(),
            ttl_header: String::new(),
        }
    }

    /// Load bindings from a Turtle-formatted prefix file.
    ///
    /// Each non-blank line must match `@prefix <tag>: <<iri>> .`
    /// (case-insensitive keyword). Lines that don't match are logged and
    /// skipped; a file with zero matching lines is not an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PrefixError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| PrefixError::Io {
            path: path_ref.display().to_string(),
            source,
        })?;

        let line_re = Regex::new(r"(?i)^@prefix[ \t]+([A-Za-z][\w-]*)[ \t]*:[ \t]*<([^>]+)>[ \t]*\.[ \t]*$")
            .expect("static prefix-line regex is valid");

        let mut registry = Self::empty();
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match line_re.captures(trimmed) {
                Some(caps) => {
                    let tag = caps[1].to_string();
                    let iri = caps[2].to_string();
                    if let Err(e) = registry.add(&tag, &iri) {
                        warn!("skipping duplicate prefix in {}: {}", path_ref.display(), e);
                    }
                }
                None => {
                    warn!("no match in {}: {:?}", path_ref.display(), trimmed);
                }
            }
        }
        Ok(registry)
    }

    /// Register one `tag -> iri` binding. Fails if `tag` is already bound.
    pub fn add(&mut self, tag: &str, iri: &str) -> Result<(), PrefixError> {
        if self.bindings.contains_key(tag) {
            return Err(PrefixError::DuplicatePrefix(tag.to_string()));
        }
        self.bindings.insert(tag.to_string(), iri.to_string());
        self.sparql_header
            .push_str(&format!("PREFIX {}: <{}>\n", tag, iri));
        self.ttl_header
            .push_str(&format!("@prefix {}: <{}> .\n", tag, iri));
        debug!("registered prefix {}: <{}>", tag, iri);
        Ok(())
    }

    /// Prepend the SPARQL header to `text`. Pure, side-effect free.
    pub fn prepend_sparql(&self, text: &str) -> String {
        format!("{}{}", self.sparql_header, text)
    }

    /// Prepend the header associated with `format`. Formats with no header
    /// of their own (`n3`, `unknown`) pass `text` through unchanged.
    pub fn prepend_for(&self, format: BodyFormat, text: &str) -> String {
        match format {
            BodyFormat::Sparql => self.prepend_sparql(text),
            BodyFormat::Ttl => format!("{}{}", self.ttl_header, text),
            BodyFormat::N3 | BodyFormat::Unknown => text.to_string(),
        }
    }

    /// Replace every occurrence of each registered IRI with `tag:` in the
    /// given payload. Pure substring substitution; no URI parsing. Payloads
    /// that are not valid UTF-8 are returned unchanged.
    pub fn shorten(&self, bytes: &[u8]) -> Vec<u8> {
        let Ok(text) = std::str::from_utf8(bytes) else {
            return bytes.to_vec();
        };
        let mut rewritten = text.to_string();
        for (tag, iri) in &self.bindings {
            rewritten = rewritten.replace(iri.as_str(), &format!("{}:", tag));
        }
        rewritten.into_bytes()
    }
}

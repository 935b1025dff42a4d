//! Hierarchical configuration sections.
//!
//! The server consumes an INI-style configuration organized as a tree of
//! named sections. Section headers use dotted paths (`[components.parquet]`
//! nests `parquet` inside `components`); entries are `key = value` lines.
//! The tree is serde-serializable so the `get_config` action can ship the
//! `application` subtree across the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing configuration text.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A section header is missing its closing bracket or is empty.
    #[error("line {line}: malformed section header `{text}`")]
    MalformedHeader {
        /// 1-based line number.
        line: usize,
        /// The offending line.
        text: String,
    },

    /// An entry line has no `=` separator.
    #[error("line {line}: expected `key = value`, found `{text}`")]
    MalformedEntry {
        /// 1-based line number.
        line: usize,
        /// The offending line.
        text: String,
    },
}

impl From<ConfigError> for crate::error::Error {
    fn from(e: ConfigError) -> Self {
        crate::error::Error::new(crate::error::ErrorKind::InvalidConfig)
            .with_context(e.to_string())
    }
}

/// One configuration section: ordered entries plus nested subsections.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    name: String,
    entries: BTreeMap<String, String>,
    sections: BTreeMap<String, Section>,
}

impl Section {
    /// Creates an empty section with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
            sections: BTreeMap::new(),
        }
    }

    /// Parses INI-style configuration text into a root section.
    ///
    /// Lines starting with `;` or `#` are comments. Section headers use
    /// dotted paths relative to the root.
    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self, ConfigError> {
        let mut root = Self::new(name);
        let mut current: Vec<String> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let Some(path) = rest.strip_suffix(']') else {
                    return Err(ConfigError::MalformedHeader {
                        line: idx + 1,
                        text: line.to_string(),
                    });
                };
                let path = path.trim();
                if path.is_empty() {
                    return Err(ConfigError::MalformedHeader {
                        line: idx + 1,
                        text: line.to_string(),
                    });
                }
                current = path.split('.').map(str::to_string).collect();
                root.ensure_section_path(&current);
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedEntry {
                    line: idx + 1,
                    text: line.to_string(),
                });
            };
            let target = root.ensure_section_path(&current);
            target
                .entries
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(root)
    }

    /// Returns the section name (the last path component).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds or replaces an entry in this section.
    pub fn add_entry(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Returns an entry of this section.
    #[must_use]
    pub fn get_entry(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Returns an entry of this section, or `default` when absent.
    #[must_use]
    pub fn get_entry_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_entry(key).unwrap_or(default)
    }

    /// Returns true if this section has an entry with the given key.
    #[must_use]
    pub fn has_entry(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts a (possibly nested) subsection, replacing any existing one.
    pub fn add_section(&mut self, section: Section) {
        self.sections.insert(section.name.clone(), section);
    }

    /// Returns the subsection at the dotted path, if present.
    #[must_use]
    pub fn get_section(&self, path: &str) -> Option<&Section> {
        let mut node = self;
        for part in path.split('.') {
            node = node.sections.get(part)?;
        }
        Some(node)
    }

    /// Returns the subsection at the dotted path, creating missing levels.
    pub fn get_section_mut(&mut self, path: &str) -> &mut Section {
        let parts: Vec<String> = path.split('.').map(str::to_string).collect();
        self.ensure_section_path(&parts)
    }

    /// Returns true if the dotted path names an existing subsection.
    #[must_use]
    pub fn has_section(&self, path: &str) -> bool {
        self.get_section(path).is_some()
    }

    /// Looks up an entry by dotted path; the last component is the key.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&str> {
        let (section_path, key) = match path.rsplit_once('.') {
            Some((s, k)) => (Some(s), k),
            None => (None, path),
        };
        match section_path {
            Some(s) => self.get_section(s)?.get_entry(key),
            None => self.get_entry(key),
        }
    }

    /// Looks up an entry by dotted path with a default.
    #[must_use]
    pub fn get_or<'a>(&'a self, path: &str, default: &'a str) -> &'a str {
        self.get(path).unwrap_or(default)
    }

    /// Sets an entry by dotted path, creating sections as needed.
    pub fn set(&mut self, path: &str, value: impl Into<String>) {
        match path.rsplit_once('.') {
            Some((section_path, key)) => {
                self.get_section_mut(section_path).add_entry(key, value);
            }
            None => self.add_entry(path, value),
        }
    }

    /// Iterates over the direct subsections in name order.
    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.values()
    }

    /// Iterates over this section's entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn ensure_section_path(&mut self, parts: &[String]) -> &mut Section {
        let mut node = self;
        for part in parts {
            node = node
                .sections
                .entry(part.clone())
                .or_insert_with(|| Section::new(part.clone()));
        }
        node
    }
}

/// Interprets an `enabled`-style entry value.
///
/// `no`, `false` and `0` (case-insensitive) disable; everything else,
/// including an absent entry, enables.
#[must_use]
pub fn flag_enabled(value: Option<&str>) -> bool {
    match value {
        Some(v) => {
            let lower = v.to_ascii_lowercase();
            !matches!(lower.as_str(), "no" | "false" | "0")
        }
        None => true,
    }
}

//! Key/value configuration source in java-properties format.
//!
//! Module descriptors (`module.properties`), per-module configuration files
//! and the database/mqtt auto-config files all use this format, so parsing
//! lives here rather than behind a serde format crate. Supports:
//!   - `key=value` and `key: value` lines, `#`/`!` comments
//!   - trailing-backslash line continuations
//!   - `${a.b.c}` dereference expressions against the source itself

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::types::{Error, Result};

/// An immutable snapshot of a properties file.
///
/// Keys are stored ordered so trace output and iteration are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from raw file contents.
    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut pending = String::new();

        for raw in text.lines() {
            let line = raw.trim_start();

            let joined = if pending.is_empty() {
                line.to_string()
            } else {
                let mut s = std::mem::take(&mut pending);
                s.push_str(line);
                s
            };

            if let Some(stripped) = joined.strip_suffix('\\') {
                pending = stripped.to_string();
                continue;
            }

            let trimmed = joined.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
                continue;
            }

            let split = trimmed
                .char_indices()
                .find(|(_, c)| *c == '=' || *c == ':')
                .map(|(i, _)| i);
            if let Some(idx) = split {
                let key = trimmed[..idx].trim().to_string();
                let value = trimmed[idx + 1..].trim().to_string();
                if !key.is_empty() {
                    entries.insert(key, value);
                }
            }
        }

        Self { entries }
    }

    /// Load and parse a properties file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Raw string lookup. Empty values are treated as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Evaluate a configuration expression against this source.
    ///
    /// `${a.b.c}` dereferences the key `a.b.c`; anything else is a literal.
    /// Returns `None` when a dereferenced key is absent.
    pub fn evaluate<'a>(&'a self, expression: &'a str) -> Option<&'a str> {
        let expression = expression.trim();
        if let Some(key) = expression
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        {
            self.get(key.trim())
        } else if expression.is_empty() {
            None
        } else {
            Some(expression)
        }
    }

    /// Typed lookup of an expression value, converted via serde.
    ///
    /// Strings pass through untouched; other target types are parsed from
    /// their literal representation (numbers, booleans, JSON structures).
    pub fn evaluate_as<T: serde::de::DeserializeOwned>(&self, expression: &str) -> Result<Option<T>> {
        let Some(raw) = self.evaluate(expression) else {
            return Ok(None);
        };
        // Try the raw literal first, then as a JSON string (covers String targets).
        match serde_json::from_str::<T>(raw) {
            Ok(v) => Ok(Some(v)),
            Err(_) => {
                let quoted = serde_json::to_string(raw)?;
                let v = serde_json::from_str::<T>(&quoted).map_err(|e| {
                    Error::internal(format!("cannot convert [{raw}] to target type: {e}"))
                })?;
                Ok(Some(v))
            }
        }
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.entries.keys().map(String::len).max().unwrap_or(0);
        for (key, value) in &self.entries {
            writeln!(f, "{key:width$} : {value}")?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

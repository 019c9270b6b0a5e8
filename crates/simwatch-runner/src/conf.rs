//! Reader and writer for the sectioned `key = value` files used for both the
//! daemon configuration and the per-attempt configuration.
//!
//! Keys are matched case-insensitively. Either `=` or `:` separates a key
//! from its value, and lines starting with `#` or `;` are comments. Writing a
//! document back keeps section and key order; comments are not preserved.

use crate::atomic_write_bytes;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ConfError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: expected `[section]` or `key = value`, found `{text}`", .path.display())]
    Syntax {
        path: PathBuf,
        line: usize,
        text: String,
    },

    #[error("{}: missing section [{section}]", .path.display())]
    MissingSection { path: PathBuf, section: String },

    #[error("{}: [{section}] {key} is required", .path.display())]
    MissingKey {
        path: PathBuf,
        section: String,
        key: String,
    },

    #[error("{}: [{section}] {key} = `{value}` is not a valid {expected}", .path.display())]
    InvalidValue {
        path: PathBuf,
        section: String,
        key: String,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfSection {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl ConfSection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfDocument {
    origin: PathBuf,
    sections: Vec<ConfSection>,
}

impl ConfDocument {
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfError> {
        let mut sections: Vec<ConfSection> = Vec::new();
        let mut current: Option<usize> = None;
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                current = match sections.iter().position(|s| s.name == name) {
                    Some(idx) => Some(idx),
                    None => {
                        sections.push(ConfSection::new(name));
                        Some(sections.len() - 1)
                    }
                };
                continue;
            }
            let separator = line.find(['=', ':']);
            match (separator, current) {
                (Some(pos), Some(idx)) if pos > 0 => {
                    let key = line[..pos].trim();
                    let value = line[pos + 1..].trim();
                    sections[idx].set(key, value);
                }
                _ => {
                    return Err(ConfError::Syntax {
                        path: origin.to_path_buf(),
                        line: idx + 1,
                        text: raw.to_string(),
                    })
                }
            }
        }
        Ok(Self {
            origin: origin.to_path_buf(),
            sections,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfError> {
        let text = fs::read_to_string(path).map_err(|source| ConfError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Like [`ConfDocument::load`] but a missing file is `Ok(None)`.
    pub fn load_optional(path: &Path) -> Result<Option<Self>, ConfError> {
        if !path.is_file() {
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    pub fn origin(&self) -> &Path {
        &self.origin
    }

    pub fn section(&self, name: &str) -> Option<&ConfSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn require_section(&self, name: &str) -> Result<&ConfSection, ConfError> {
        self.section(name).ok_or_else(|| ConfError::MissingSection {
            path: self.origin.clone(),
            section: name.to_string(),
        })
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    /// Present and non-empty values only.
    pub fn get_str(&self, section: &str, key: &str) -> Option<String> {
        self.get(section, key)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    pub fn get_parsed<T: FromStr>(
        &self,
        section: &str,
        key: &str,
        expected: &'static str,
    ) -> Result<Option<T>, ConfError> {
        match self.get(section, key).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| ConfError::InvalidValue {
                path: self.origin.clone(),
                section: section.to_string(),
                key: key.to_string(),
                value: raw.to_string(),
                expected,
            }),
        }
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.sections.iter_mut().find(|s| s.name == section) {
            Some(s) => s.set(key, &value),
            None => {
                let mut s = ConfSection::new(section);
                s.set(key, &value);
                self.sections.push(s);
            }
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (idx, section) in self.sections.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", section.name));
            for (key, value) in section.entries() {
                out.push_str(&format!("{} = {}\n", key, value));
            }
        }
        out
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        atomic_write_bytes(path, self.render().as_bytes())
    }
}

/*
 * SPDX-FileCopyrightText: 2025 HavenDNS contributors
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Config file editing (`config set`)
//!
//! The file is user-owned, so edits must be conservative: key order and
//! comments survive a rewrite, values that disappear are commented out
//! with a timestamp instead of being deleted, and keys the file has never
//! seen are appended in alphabetical position. The rewrite is atomic
//! (temp file + rename).

use std::path::Path;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::core::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Blank,
    /// Full-line comment, stored verbatim
    Comment(String),
    Entry {
        key: String,
        value: String,
        /// Inline comment text after the value, without the `#`
        comment: Option<String>,
    },
}

#[derive(Debug, Default)]
pub struct ConfigFile {
    lines: Vec<Line>,
}

impl ConfigFile {
    /// Load for editing; a missing file is an empty one
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::parse(&contents))
    }

    fn parse(contents: &str) -> Self {
        let lines = contents.lines().map(parse_line).collect();
        Self { lines }
    }

    /// All effective `(key, value)` pairs in file order
    pub fn entries(&self) -> Vec<(&str, &str)> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                Line::Entry { key, value, .. } => Some((key.as_str(), value.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Make `values` the complete value set for `key`.
    ///
    /// Existing lines whose value is still wanted stay untouched; dropped
    /// values are commented out with a timestamp; values the file lacks
    /// are inserted after the key's last line (or alphabetically for a
    /// new key).
    pub fn set(&mut self, key: &str, values: &[String]) {
        let mut pending: Vec<&String> = values.iter().collect();
        let stamp = timestamp();

        let mut last_key_line: Option<usize> = None;
        for (idx, line) in self.lines.iter_mut().enumerate() {
            let Line::Entry {
                key: line_key,
                value,
                ..
            } = line
            else {
                continue;
            };
            if line_key != key {
                continue;
            }
            last_key_line = Some(idx);
            if let Some(pos) = pending.iter().position(|v| *v == value) {
                pending.remove(pos);
            } else {
                *line = Line::Comment(format!("# removed {stamp}: {key} {value}"));
            }
        }

        let insert_at = match last_key_line {
            Some(idx) => idx + 1,
            None => self.alphabetical_slot(key),
        };
        for (offset, value) in pending.into_iter().enumerate() {
            self.lines.insert(
                insert_at + offset,
                Line::Entry {
                    key: key.to_string(),
                    value: value.clone(),
                    comment: None,
                },
            );
        }
    }

    /// Where a never-seen key goes: before the first entry that sorts
    /// after it, else the end of the file
    fn alphabetical_slot(&self, key: &str) -> usize {
        for (idx, line) in self.lines.iter().enumerate() {
            if let Line::Entry { key: line_key, .. } = line {
                if line_key.as_str() > key {
                    return idx;
                }
            }
        }
        self.lines.len()
    }

    /// Atomic rewrite
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Blank => {}
                Line::Comment(text) => out.push_str(text),
                Line::Entry {
                    key,
                    value,
                    comment,
                } => {
                    out.push_str(key);
                    out.push(' ');
                    out.push_str(value);
                    if let Some(comment) = comment {
                        out.push_str(" # ");
                        out.push_str(comment);
                    }
                }
            }
            out.push('\n');
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, out)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn parse_line(raw: &str) -> Line {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Line::Blank;
    }
    if trimmed.starts_with('#') {
        return Line::Comment(raw.to_string());
    }
    let (body, comment) = match trimmed.split_once('#') {
        Some((body, comment)) => (body.trim(), Some(comment.trim().to_string())),
        None => (trimmed, None),
    };
    match body.split_once(char::is_whitespace) {
        Some((key, value)) => Line::Entry {
            key: key.to_string(),
            value: value.trim().to_string(),
            comment,
        },
        None => Line::Entry {
            key: body.to_string(),
            value: String::new(),
            comment,
        },
    }
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# havendns configuration
listen 127.0.0.1:53
cache-size 100MB # plenty

config 10.0.0.0/24=work
config home
";

    #[test]
    fn parse_round_trip() {
        let file = ConfigFile::parse(SAMPLE);
        assert_eq!(
            file.entries(),
            vec![
                ("listen", "127.0.0.1:53"),
                ("cache-size", "100MB"),
                ("config", "10.0.0.0/24=work"),
                ("config", "home"),
            ]
        );
    }

    #[test]
    fn set_preserves_order_and_comments() {
        let mut file = ConfigFile::parse(SAMPLE);
        file.set("cache-size", &["250MB".to_string()]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("havendns.conf");
        file.save(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();

        assert!(written.starts_with("# havendns configuration\n"));
        // Old value is commented out in place, new one inserted after
        assert!(written.contains("# removed "));
        assert!(written.contains(": cache-size 100MB"));
        assert!(written.contains("cache-size 250MB"));
        let listen_pos = written.find("listen ").unwrap();
        let cache_pos = written.find("cache-size 250MB").unwrap();
        assert!(listen_pos < cache_pos);
    }

    #[test]
    fn repeated_keys_update_in_place() {
        let mut file = ConfigFile::parse(SAMPLE);
        file.set(
            "config",
            &["10.0.0.0/24=work".to_string(), "travel".to_string()],
        );
        let entries = file.entries();
        let configs: Vec<&str> = entries
            .iter()
            .filter(|(k, _)| *k == "config")
            .map(|(_, v)| *v)
            .collect();
        // Kept value stays, dropped one is gone, new one appended after
        assert_eq!(configs, vec!["10.0.0.0/24=work", "travel"]);
    }

    #[test]
    fn new_keys_insert_alphabetically() {
        let mut file = ConfigFile::parse(SAMPLE);
        file.set("bogus-priv", &["true".to_string()]);
        let entries = file.entries();
        let keys: Vec<&str> = entries.iter().map(|(k, _)| *k).collect();
        // "bogus-priv" sorts before "cache-size"
        let bogus = keys.iter().position(|k| *k == "bogus-priv").unwrap();
        let cache = keys.iter().position(|k| *k == "cache-size").unwrap();
        assert!(bogus < cache);
    }

    #[test]
    fn missing_file_is_empty() {
        let file = ConfigFile::load(Path::new("/nonexistent/havendns.conf")).unwrap();
        assert!(file.entries().is_empty());
    }
}

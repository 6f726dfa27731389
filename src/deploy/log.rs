// src/deploy/log.rs

//! Append-only switch log of one component at a deployment target
//!
//! The log is the source of truth for which version is current. Each
//! record is one line with a CRC32 checksum:
//!
//! Format: `{crc32_hex}|{json}\n`
//!
//! Reading stops at the first damaged line, so a torn or corrupted tail is
//! ignored. Appends rewrite the file through a temp file and a rename, and
//! are done only while the component lock is held.

use crate::error::Result;
use crate::filesystem::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};
use tracing::warn;

/// Why the alias was moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SwitchReason {
    Deploy,
    Switch,
    Rollback,
}

/// One move of `current/<type>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchEvent {
    pub component_type: String,
    pub version: String,
    #[serde(default)]
    pub previous_version: Option<String>,
    /// Release that brought this version in, for deploy events
    #[serde(default)]
    pub source_release: Option<String>,
    pub reason: SwitchReason,
    pub switched_at: DateTime<Utc>,
}

/// Switch log file
#[derive(Debug, Clone)]
pub struct RegistryLog {
    path: PathBuf,
}

impl RegistryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All intact events, oldest first. A missing log is empty.
    pub fn read_all(&self) -> Result<Vec<SwitchEvent>> {
        Ok(self
            .intact_lines()?
            .into_iter()
            .map(|(_, event)| event)
            .collect())
    }

    /// The most recent event
    pub fn last(&self) -> Result<Option<SwitchEvent>> {
        Ok(self.read_all()?.pop())
    }

    /// Append `event`, dropping any damaged tail
    pub fn append(&self, event: &SwitchEvent) -> Result<()> {
        let mut contents = String::new();
        for (line, _) in self.intact_lines()? {
            contents.push_str(&line);
            contents.push('\n');
        }
        contents.push_str(&encode(event)?);
        contents.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.path, contents.as_bytes(), true)?;
        Ok(())
    }

    fn intact_lines(&self) -> Result<Vec<(String, SwitchEvent)>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("Registry log {} is not valid UTF-8, reading it as empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut lines = Vec::new();
        for (line_num, line) in text.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            match decode(line) {
                Some(event) => lines.push((line.to_string(), event)),
                None => {
                    warn!(
                        "Ignoring damaged registry log tail at {}:{}",
                        self.path.display(),
                        line_num + 1
                    );
                    break;
                }
            }
        }
        Ok(lines)
    }
}

fn encode(event: &SwitchEvent) -> Result<String> {
    let json = serde_json::to_string(event)?;
    let crc = crc32fast::hash(json.as_bytes());
    Ok(format!("{:08x}|{}", crc, json))
}

fn decode(line: &str) -> Option<SwitchEvent> {
    let (crc, json) = line.split_once('|')?;
    let expected = u32::from_str_radix(crc, 16).ok()?;
    if crc32fast::hash(json.as_bytes()) != expected {
        return None;
    }
    serde_json::from_str(json).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn event(version: &str, previous: Option<&str>) -> SwitchEvent {
        SwitchEvent {
            component_type: "model".to_string(),
            version: version.to_string(),
            previous_version: previous.map(str::to_string),
            source_release: Some("2024.01.20".to_string()),
            reason: SwitchReason::Deploy,
            switched_at: Utc::now(),
        }
    }

    #[test]
    fn test_reason_names() {
        assert_eq!(SwitchReason::Rollback.to_string(), "rollback");
        assert_eq!("deploy".parse::<SwitchReason>().unwrap(), SwitchReason::Deploy);
    }

    #[test]
    fn test_append_and_read() {
        let temp = TempDir::new().unwrap();
        let log = RegistryLog::new(temp.path().join("registry/model.log"));
        assert!(log.read_all().unwrap().is_empty());
        assert!(log.last().unwrap().is_none());

        log.append(&event("1.0.0", None)).unwrap();
        log.append(&event("1.0.1", Some("1.0.0"))).unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].previous_version.as_deref(), Some("1.0.0"));
        assert_eq!(log.last().unwrap().unwrap().version, "1.0.1");

        let text = fs::read_to_string(log.path()).unwrap();
        let first = text.lines().next().unwrap();
        assert_eq!(first.split_once('|').unwrap().0.len(), 8);
        assert!(first.contains(r#""reason":"deploy""#));
    }

    #[test]
    fn test_corrupted_tail_is_ignored_and_dropped_on_append() {
        let temp = TempDir::new().unwrap();
        let log = RegistryLog::new(temp.path().join("model.log"));
        log.append(&event("1.0.0", None)).unwrap();

        let mut file = fs::OpenOptions::new().append(true).open(log.path()).unwrap();
        writeln!(file, "deadbeef|{{\"torn\":").unwrap();
        drop(file);

        assert_eq!(log.read_all().unwrap().len(), 1);

        log.append(&event("1.0.1", Some("1.0.0"))).unwrap();
        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(!text.contains("torn"));
    }

    #[test]
    fn test_checksum_mismatch_stops_reading() {
        let temp = TempDir::new().unwrap();
        let log = RegistryLog::new(temp.path().join("model.log"));
        log.append(&event("1.0.0", None)).unwrap();
        log.append(&event("1.0.1", Some("1.0.0"))).unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let tampered = text.replacen("1.0.0", "9.9.9", 1);
        fs::write(log.path(), tampered).unwrap();

        assert!(log.read_all().unwrap().is_empty());
    }
}

//! Run audit log persisted as XML.
//!
//! Every run appends (or replaces, see [`History::replace_with`]) one
//! [`Changelog`]: a timestamped success flag, free-form log entries, and an
//! optional TODO left for the next run. The file lives next to the code being
//! edited and is written owner-only.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;

use crate::error::AxeErr;
use crate::xml;

/// Default history filename under the runner's base directory.
pub const DEFAULT_HISTORY_FILE: &str = ".axe_history.xml";

const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changelog {
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub logs: Vec<String>,
    pub todo: String,
}

impl Changelog {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            success: false,
            logs: Vec::new(),
            todo: String::new(),
        }
    }

    pub fn add_log(&mut self, entry: impl Into<String>) {
        self.logs.push(entry.into());
    }
}

impl Default for Changelog {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared mutable view of the changelog under construction. The finalize
/// tool and the runner both hold one, so neither owns the other.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChangelogHandle {
    inner: Arc<Mutex<Changelog>>,
}

impl ChangelogHandle {
    pub(crate) fn new(changelog: Changelog) -> Self {
        Self {
            inner: Arc::new(Mutex::new(changelog)),
        }
    }

    pub(crate) fn add_log(&self, entry: impl Into<String>) {
        if let Ok(mut changelog) = self.inner.lock() {
            changelog.add_log(entry);
        }
    }

    pub(crate) fn set_success(&self, success: bool) {
        if let Ok(mut changelog) = self.inner.lock() {
            changelog.success = success;
        }
    }

    pub(crate) fn set_todo(&self, todo: impl Into<String>) {
        if let Ok(mut changelog) = self.inner.lock() {
            changelog.todo = todo.into();
        }
    }

    pub(crate) fn snapshot(&self) -> Changelog {
        self.inner
            .lock()
            .map(|changelog| changelog.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub changelogs: Vec<Changelog>,
    file_path: Option<PathBuf>,
}

impl History {
    pub fn append_changelog(&mut self, changelog: Changelog) {
        self.changelogs.push(changelog);
    }

    /// Drops all prior changelogs, keeping only the given one.
    pub fn replace_with(&mut self, changelog: Changelog) {
        self.changelogs = vec![changelog];
    }

    pub fn last_changelog_timestamp(&self) -> Option<DateTime<Utc>> {
        self.changelogs.last().map(|c| c.timestamp)
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    fn to_xml(&self) -> String {
        let mut out = String::from(XML_HEADER);
        out.push_str("<History>\n  <Changelogs>");
        for changelog in &self.changelogs {
            out.push_str("\n    <Changelog>\n      <Timestamp>");
            out.push_str(&changelog.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true));
            out.push_str("</Timestamp>\n      <Success>");
            out.push_str(if changelog.success { "true" } else { "false" });
            out.push_str("</Success>\n      <Logs>");
            for log in &changelog.logs {
                out.push_str("\n        <Log>");
                out.push_str(&xml::cdata(log));
                out.push_str("</Log>");
            }
            if !changelog.logs.is_empty() {
                out.push_str("\n      ");
            }
            out.push_str("</Logs>\n      <TODO>");
            out.push_str(&xml::escape_text(&changelog.todo));
            out.push_str("</TODO>\n    </Changelog>");
        }
        if !self.changelogs.is_empty() {
            out.push_str("\n  ");
        }
        out.push_str("</Changelogs>\n</History>\n");
        out
    }

    fn from_xml(payload: &str) -> Result<Self, AxeErr> {
        let root = xml::find_element(payload, "History")
            .ok_or_else(|| AxeErr::History("missing <History> root".to_string()))?;
        let mut history = History::default();
        let Some(changelogs) = xml::find_element(root.body, "Changelogs") else {
            return Ok(history);
        };
        for raw in xml::find_elements(changelogs.body, "Changelog") {
            let timestamp_text = xml::find_element(raw.body, "Timestamp")
                .map(|el| xml::element_text(el.body))
                .unwrap_or_default();
            let timestamp = DateTime::parse_from_rfc3339(timestamp_text.trim())
                .map_err(|e| AxeErr::History(format!("bad Timestamp {timestamp_text:?}: {e}")))?
                .with_timezone(&Utc);
            let success = xml::find_element(raw.body, "Success")
                .map(|el| xml::element_text(el.body).trim() == "true")
                .unwrap_or(false);
            let logs = xml::find_element(raw.body, "Logs")
                .map(|el| {
                    xml::find_elements(el.body, "Log")
                        .into_iter()
                        .map(|log| xml::element_text(log.body))
                        .collect()
                })
                .unwrap_or_default();
            let todo = xml::find_element(raw.body, "TODO")
                .map(|el| xml::element_text(el.body))
                .unwrap_or_default();
            history.changelogs.push(Changelog {
                timestamp,
                success,
                logs,
                todo,
            });
        }
        Ok(history)
    }

    /// Writes the history as XML (header included) with owner-only
    /// permissions, creating parent directories as needed.
    pub fn save(&self) -> Result<(), AxeErr> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| AxeErr::History(format!("create {}: {e}", parent.display())))?;
            }
        }
        fs::write(path, self.to_xml())
            .map_err(|e| AxeErr::History(format!("write {}: {e}", path.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .map_err(|e| AxeErr::History(format!("chmod {}: {e}", path.display())))?;
        }
        Ok(())
    }
}

/// Loads a history file, treating a missing or empty file as an empty
/// history bound to the same path.
pub fn read_history_from_file(path: impl Into<PathBuf>) -> Result<History, AxeErr> {
    let path = path.into();
    let mut history = match fs::read_to_string(&path) {
        Ok(data) if data.trim().is_empty() => History::default(),
        Ok(data) => History::from_xml(&data)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => History::default(),
        Err(e) => return Err(AxeErr::History(format!("read {}: {e}", path.display()))),
    };
    history.file_path = Some(path);
    Ok(history)
}

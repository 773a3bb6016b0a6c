//! In-memory view of the files an editing session may touch.
//!
//! The flow mirrors the prompt contract: files load from disk into a
//! [`CodeContainer`], render as CodeInput XML for the model, come back as
//! CodeOutput XML carrying a v4a patch, and are flushed to disk once the
//! patch applies cleanly. The container is the single source of truth for
//! file state during a run.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use axe_apply_patch::FileSystem;
use axe_apply_patch::PatchError;
use tracing::debug;

use crate::error::AxeErr;
use crate::xml;

#[derive(Debug, Clone, Default)]
pub struct CodeContainer {
    files: HashMap<String, String>,
    removed: HashSet<String>,
}

impl CodeContainer {
    /// Builds a container over a copy of the provided files map.
    pub fn new(files: HashMap<String, String>) -> Self {
        Self {
            files,
            removed: HashSet::new(),
        }
    }

    /// Reads the given paths into a container. Relative paths are joined to
    /// `base_dir`; blank entries are skipped. Keys are the resolved paths.
    pub fn from_fs(base_dir: &Path, paths: &[String]) -> crate::Result<Self> {
        let mut files = HashMap::with_capacity(paths.len());
        for path in paths {
            let path = path.trim();
            if path.is_empty() {
                continue;
            }
            let full: PathBuf = if Path::new(path).is_absolute() {
                PathBuf::from(path)
            } else {
                base_dir.join(path)
            };
            let content = fs::read_to_string(&full).map_err(|e| {
                AxeErr::InvalidConfig(format!("read {}: {e}", full.display()))
            })?;
            files.insert(full.to_string_lossy().into_owned(), content);
        }
        Ok(Self::new(files))
    }

    /// Snapshot of the live (non-deleted) files.
    pub fn files(&self) -> HashMap<String, String> {
        self.files.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Applies v4a patch text, mutating the in-memory state only. Errors are
    /// suitable for echoing back to the model.
    pub fn apply(&mut self, patch_text: &str) -> Result<String, PatchError> {
        axe_apply_patch::apply_patch(self, patch_text)
    }

    /// Flushes every live file to disk and removes deletion-marked paths.
    /// Parent directories are created as needed; an existing file keeps its
    /// permissions, a new one is written owner-only.
    pub fn write_to_files(&self) -> std::io::Result<Vec<String>> {
        let mut written: Vec<String> = self.files.keys().cloned().collect();
        written.sort();
        for path in &written {
            let full = Path::new(path);
            if let Some(parent) = full.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::DirBuilder::new().recursive(true).create(parent)?;
                }
            }
            #[cfg(unix)]
            let mode = {
                use std::os::unix::fs::PermissionsExt;
                fs::metadata(full)
                    .map(|m| m.permissions().mode() & 0o777)
                    .unwrap_or(0o600)
            };
            fs::write(full, &self.files[path])?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(full, fs::Permissions::from_mode(mode))?;
            }
        }
        for path in &self.removed {
            match fs::remove_file(path) {
                Ok(()) => debug!(path, "removed deleted file from disk"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Renders the selected paths (all when the filter is empty) as CodeInput.
    pub fn build_code_input(&self, filter: &[String]) -> CodeInput {
        build_code_input(&self.files, filter)
    }
}

impl FileSystem for CodeContainer {
    fn open(&self, path: &str) -> Result<String, PatchError> {
        if self.removed.contains(path) {
            return Err(PatchError::new(format!("open {path}: file has been deleted")));
        }
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| PatchError::new(format!("open {path}: file not found")))
    }

    fn write(&mut self, path: &str, content: &str) -> Result<(), PatchError> {
        self.removed.remove(path);
        self.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), PatchError> {
        self.files.remove(path);
        self.removed.insert(path.to_string());
        Ok(())
    }
}

/// The file set rendered for the model: path-sorted, CDATA-wrapped contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeInput {
    pub files: Vec<CodeFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFile {
    pub path: String,
    pub content: String,
}

pub fn build_code_input(files: &HashMap<String, String>, filter: &[String]) -> CodeInput {
    let mut selected: Vec<&String> = if filter.is_empty() {
        files.keys().collect()
    } else {
        let mut seen = HashSet::new();
        filter
            .iter()
            .filter_map(|raw| {
                let (path, _) = files.get_key_value(raw.trim())?;
                seen.insert(path).then_some(path)
            })
            .collect()
    };
    selected.sort();

    CodeInput {
        files: selected
            .into_iter()
            .map(|path| CodeFile {
                path: path.clone(),
                content: files[path].clone(),
            })
            .collect(),
    }
}

impl CodeInput {
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<CodeInput>");
        for file in &self.files {
            out.push_str("\n  <File path=\"");
            out.push_str(&xml::escape_attr(&file.path));
            out.push_str("\">");
            out.push_str(&xml::cdata(&file.content));
            out.push_str("</File>");
        }
        if !self.files.is_empty() {
            out.push('\n');
        }
        out.push_str("</CodeInput>");
        out
    }
}

/// Parses a CodeInput document back into paths and contents.
pub fn parse_code_input(payload: &str) -> Result<CodeInput, String> {
    let envelope = xml::find_element(payload.trim(), "CodeInput")
        .ok_or_else(|| "missing <CodeInput> envelope".to_string())?;
    let files = xml::find_elements(envelope.body, "File")
        .into_iter()
        .map(|el| {
            let path = xml::attr_value(el.attrs, "path")
                .ok_or_else(|| "File element without path attribute".to_string())?;
            Ok(CodeFile {
                path,
                content: xml::element_text(el.body),
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(CodeInput { files })
}

/// The model's edit envelope: a v4a patch wrapped in CDATA.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeOutput {
    pub version: Option<String>,
    pub patch: String,
}

pub fn parse_code_output(payload: &str) -> Result<CodeOutput, String> {
    let envelope = xml::find_element(payload.trim(), "CodeOutput")
        .ok_or_else(|| "missing <CodeOutput> envelope".to_string())?;
    let patch = xml::element_text(envelope.body);
    if patch.trim().is_empty() {
        return Err("CodeOutput envelope carries no patch text".to_string());
    }
    Ok(CodeOutput {
        version: xml::attr_value(envelope.attrs, "version"),
        patch,
    })
}

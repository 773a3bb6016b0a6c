//! Applies human-readable "pseudo-diff" patch text (the v4a format) to a
//! collection of text files.
//!
//! A patch is a sequence of file actions delimited by `*** Begin Patch` /
//! `*** End Patch`. Each action adds, deletes, or updates one file; updates
//! carry one or more hunks whose context lines are located in the target file
//! with escalating whitespace tolerance.

mod parser;
mod seek_sequence;

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

pub use parser::text_to_patch;

/// Error raised while parsing or applying a patch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PatchError {
    message: String,
}

impl PatchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Abstraction over the file store a patch is applied against. Implementors
/// decide whether writes hit a real filesystem, an in-memory map, or both.
pub trait FileSystem {
    /// Returns the current content of `path`, or an error if the path is not
    /// available for patching.
    fn open(&self, path: &str) -> Result<String>;
    fn write(&mut self, path: &str, content: &str) -> Result<()>;
    fn remove(&mut self, path: &str) -> Result<()>;
}

/// A localized edit: at line offset `orig_index` in the original file,
/// `del_lines` are removed and `ins_lines` inserted in their place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    pub orig_index: usize,
    pub del_lines: Vec<String>,
    pub ins_lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchAction {
    Add {
        content: String,
    },
    Delete,
    Update {
        chunks: Vec<Chunk>,
        move_path: Option<String>,
    },
}

/// An ordered set of actions, each keyed by a path that is unique within the
/// patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    pub actions: Vec<(String, PatchAction)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Add {
        content: String,
    },
    Delete {
        old_content: String,
    },
    Update {
        old_content: String,
        new_content: String,
        move_path: Option<String>,
    },
}

/// The snapshot-level effect of a patch: per-path old/new content with an
/// optional move destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commit {
    pub changes: Vec<(String, FileChange)>,
}

/// Rebuilds the destination file for an update action by folding its chunks
/// over the original content.
fn get_updated_file(text: &str, chunks: &[Chunk], path: &str) -> Result<String> {
    let orig_lines: Vec<&str> = text.split('\n').collect();
    let mut dest_lines: Vec<&str> = Vec::with_capacity(orig_lines.len());
    let mut orig_index = 0usize;

    for chunk in chunks {
        if chunk.orig_index > orig_lines.len() {
            return Err(PatchError::new(format!(
                "{path}: chunk.orig_index {} exceeds file length",
                chunk.orig_index
            )));
        }
        if orig_index > chunk.orig_index {
            return Err(PatchError::new(format!(
                "{path}: overlapping chunks at {orig_index} > {}",
                chunk.orig_index
            )));
        }
        dest_lines.extend(&orig_lines[orig_index..chunk.orig_index]);
        orig_index = chunk.orig_index;
        dest_lines.extend(chunk.ins_lines.iter().map(String::as_str));
        orig_index += chunk.del_lines.len();
    }
    dest_lines.extend(&orig_lines[orig_index..]);
    Ok(dest_lines.join("\n"))
}

/// Materializes old/new content for every action of a parsed patch.
pub fn patch_to_commit(patch: &Patch, orig: &HashMap<String, String>) -> Result<Commit> {
    let mut commit = Commit::default();
    for (path, action) in &patch.actions {
        let change = match action {
            PatchAction::Delete => FileChange::Delete {
                old_content: orig.get(path).cloned().unwrap_or_default(),
            },
            PatchAction::Add { content } => FileChange::Add {
                content: content.clone(),
            },
            PatchAction::Update { chunks, move_path } => {
                let old_content = orig.get(path).cloned().unwrap_or_default();
                let new_content = get_updated_file(&old_content, chunks, path)?;
                FileChange::Update {
                    old_content,
                    new_content,
                    move_path: move_path.clone(),
                }
            }
        };
        commit.changes.push((path.clone(), change));
    }
    Ok(commit)
}

/// Paths a patch reads before applying: update and delete targets.
pub fn identify_files_needed(text: &str) -> Vec<String> {
    let lines = parser::split_lines(text);
    let mut out = Vec::new();
    for line in &lines {
        if let Some(path) = line.strip_prefix("*** Update File: ") {
            out.push(path.to_string());
        }
    }
    for line in &lines {
        if let Some(path) = line.strip_prefix("*** Delete File: ") {
            out.push(path.to_string());
        }
    }
    out
}

/// Paths a patch introduces via add actions.
pub fn identify_files_added(text: &str) -> Vec<String> {
    parser::split_lines(text)
        .iter()
        .filter_map(|line| line.strip_prefix("*** Add File: "))
        .map(str::to_string)
        .collect()
}

fn load_files(paths: &[String], fs: &dyn FileSystem) -> Result<HashMap<String, String>> {
    let mut files = HashMap::with_capacity(paths.len());
    for path in paths {
        files.insert(path.clone(), fs.open(path)?);
    }
    Ok(files)
}

/// Replays a staged commit against the file store. A move writes the new
/// content to the destination and removes the source.
pub fn apply_commit(commit: &Commit, fs: &mut dyn FileSystem) -> Result<()> {
    for (path, change) in &commit.changes {
        match change {
            FileChange::Delete { .. } => fs.remove(path)?,
            FileChange::Add { content } => fs.write(path, content)?,
            FileChange::Update {
                new_content,
                move_path,
                ..
            } => {
                let target = move_path.as_deref().unwrap_or(path);
                fs.write(target, new_content)?;
                if move_path.is_some() {
                    fs.remove(path)?;
                }
            }
        }
    }
    Ok(())
}

fn process_patch(text: &str, fs: &mut dyn FileSystem) -> Result<String> {
    if !text.starts_with("*** Begin Patch") {
        return Err(PatchError::new("Patch text must start with *** Begin Patch"));
    }
    let paths = identify_files_needed(text);
    let orig = load_files(&paths, fs)?;
    let (patch, fuzz) = text_to_patch(text, &orig)
        .map_err(|e| PatchError::new(format!("failed to parse patch: {e}")))?;
    if fuzz > 0 {
        debug!(fuzz, "patch context matched with whitespace tolerance");
    }
    let commit = patch_to_commit(&patch, &orig)
        .map_err(|e| PatchError::new(format!("failed to convert patch to commit: {e}")))?;
    apply_commit(&commit, fs)
        .map_err(|e| PatchError::new(format!("failed to apply commit: {e}")))?;
    Ok("Done!".to_string())
}

/// Applies a patch against a [`FileSystem`]. Surrounding whitespace in the
/// patch text is trimmed before parsing.
pub fn apply_patch(fs: &mut dyn FileSystem, patch_text: &str) -> Result<String> {
    let mut text = patch_text.trim().to_string();
    text.push('\n');
    process_patch(&text, fs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct MapFs {
        files: HashMap<String, String>,
    }

    impl MapFs {
        fn seeded(entries: &[(&str, &str)]) -> Self {
            Self {
                files: entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            }
        }
    }

    impl FileSystem for MapFs {
        fn open(&self, path: &str) -> Result<String> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| PatchError::new(format!("missing file: {path}")))
        }

        fn write(&mut self, path: &str, content: &str) -> Result<()> {
            self.files.insert(path.to_string(), content.to_string());
            Ok(())
        }

        fn remove(&mut self, path: &str) -> Result<()> {
            self.files.remove(path);
            Ok(())
        }
    }

    #[test]
    fn update_replaces_a_single_line() {
        let chunks = vec![Chunk {
            orig_index: 1,
            del_lines: vec!["line2".into()],
            ins_lines: vec!["line-x".into()],
        }];
        let updated = get_updated_file("line1\nline2\nline3", &chunks, "f").unwrap();
        assert_eq!(updated, "line1\nline-x\nline3");
    }

    #[test]
    fn overlapping_chunks_are_rejected() {
        let chunks = vec![
            Chunk {
                orig_index: 1,
                del_lines: vec!["b".into()],
                ins_lines: vec![],
            },
            Chunk {
                orig_index: 1,
                del_lines: vec![],
                ins_lines: vec!["x".into()],
            },
        ];
        let err = get_updated_file("a\nb\nc", &chunks, "f").unwrap_err();
        assert!(err.to_string().contains("overlapping chunks"), "{err}");
    }

    #[test]
    fn chunk_past_end_of_file_is_rejected() {
        let chunks = vec![Chunk {
            orig_index: 9,
            del_lines: vec![],
            ins_lines: vec!["x".into()],
        }];
        let err = get_updated_file("a\nb", &chunks, "f").unwrap_err();
        assert!(err.to_string().contains("exceeds file length"), "{err}");
    }

    #[test]
    fn identify_files_collects_update_delete_then_add() {
        let text = "*** Begin Patch\n*** Add File: c\n+x\n*** Update File: a\n@@\n-x\n+y\n*** Delete File: b\n*** End Patch\n";
        assert_eq!(identify_files_needed(text), vec!["a", "b"]);
        assert_eq!(identify_files_added(text), vec!["c"]);
    }

    #[test]
    fn apply_patch_moves_deletes_and_adds() {
        let mut fs = MapFs::seeded(&[("foo", "line1\nline2"), ("bar", "old")]);
        let patch = concat!(
            "*** Begin Patch\n",
            "*** Update File: foo\n",
            "*** Move to: foo-renamed\n",
            "@@\n",
            " line1\n",
            "-line2\n",
            "+line2 updated\n",
            "*** Delete File: bar\n",
            "*** Add File: new\n",
            "+fresh\n",
            "*** End Patch\n",
        );
        let result = apply_patch(&mut fs, patch).unwrap();
        assert_eq!(result, "Done!");
        assert_eq!(
            fs,
            MapFs::seeded(&[("foo-renamed", "line1\nline2 updated"), ("new", "fresh")])
        );
    }

    #[test]
    fn apply_patch_trims_surrounding_noise() {
        let mut fs = MapFs::seeded(&[("a.txt", "one\ntwo")]);
        let patch = "\n\n*** Begin Patch\n*** Update File: a.txt\n@@\n-two\n+three\n*** End Patch\n\n";
        apply_patch(&mut fs, patch).unwrap();
        assert_eq!(fs.files["a.txt"], "one\nthree");
    }

    #[test]
    fn patch_must_start_with_begin_sentinel() {
        let mut fs = MapFs::default();
        let err = apply_patch(&mut fs, "hello\n").unwrap_err();
        assert!(err.to_string().contains("*** Begin Patch"), "{err}");
    }
}

//! Tokenizer for v4a patch text.
//!
//! The parser walks the patch line by line, producing one [`PatchAction`] per
//! `*** Add File:` / `*** Delete File:` / `*** Update File:` header. Update
//! bodies are cut into hunks whose context is resolved against the current
//! file content via [`seek_context`].

use std::collections::HashMap;

use crate::Chunk;
use crate::Patch;
use crate::PatchAction;
use crate::PatchError;
use crate::Result;
use crate::seek_sequence::seek_context;

const BEGIN_PATCH: &str = "*** Begin Patch";
const END_PATCH: &str = "*** End Patch";
const END_OF_FILE: &str = "*** End of File";
const UPDATE_FILE: &str = "*** Update File: ";
const DELETE_FILE: &str = "*** Delete File: ";
const ADD_FILE: &str = "*** Add File: ";
const MOVE_TO: &str = "*** Move to: ";

/// Sentinels that terminate the body of the current action.
const SECTION_ENDS: &[&str] = &[
    END_PATCH,
    "*** Update File:",
    "*** Delete File:",
    "*** Add File:",
];

/// Splits on `\n`, `\r\n`, and `\r` without keeping separators, matching
/// Python's `str.splitlines(keepends=False)` for those breaks.
pub(crate) fn split_lines(s: &str) -> Vec<String> {
    let bytes = s.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(s[start..i].to_string());
                i += 1;
                start = i;
            }
            b'\r' => {
                lines.push(s[start..i].to_string());
                if i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
                    i += 2;
                } else {
                    i += 1;
                }
                start = i;
            }
            _ => i += 1,
        }
    }
    if start != bytes.len() {
        lines.push(s[start..].to_string());
    }
    lines
}

/// Strips trailing carriage returns so sentinel checks accept CRLF input.
fn norm(line: &str) -> &str {
    line.trim_end_matches('\r')
}

struct Parser<'a> {
    current_files: &'a HashMap<String, String>,
    lines: Vec<String>,
    index: usize,
    actions: Vec<(String, PatchAction)>,
    fuzz: u64,
}

impl Parser<'_> {
    fn cur_line(&self) -> Result<&str> {
        self.lines
            .get(self.index)
            .map(String::as_str)
            .ok_or_else(|| PatchError::new("Unexpected end of input while parsing patch"))
    }

    fn is_done(&self, prefixes: &[&str]) -> bool {
        let Some(line) = self.lines.get(self.index) else {
            return true;
        };
        let line = norm(line);
        prefixes.iter().any(|prefix| line.starts_with(prefix))
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.lines
            .get(self.index)
            .is_some_and(|line| norm(line).starts_with(prefix))
    }

    /// Consumes the current line when it starts with `prefix` and returns the
    /// raw remainder (payloads keep any trailing carriage return).
    fn read_str(&mut self, prefix: &str) -> Option<String> {
        let line = self.lines.get(self.index)?;
        if norm(line).starts_with(prefix) {
            let text = line[prefix.len()..].to_string();
            self.index += 1;
            Some(text)
        } else {
            None
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let line = self.cur_line()?.to_string();
        self.index += 1;
        Ok(line)
    }

    fn has_action(&self, path: &str) -> bool {
        self.actions.iter().any(|(p, _)| p == path)
    }

    fn parse(&mut self) -> Result<()> {
        while !self.is_done(&[END_PATCH]) {
            if let Some(path) = self.read_str(UPDATE_FILE) {
                if self.has_action(&path) {
                    return Err(PatchError::new(format!("Duplicate update for file: {path}")));
                }
                let move_path = self.read_str(MOVE_TO).filter(|p| !p.is_empty());
                let Some(text) = self.current_files.get(&path) else {
                    return Err(PatchError::new(format!(
                        "Update File Error - missing file: {path}"
                    )));
                };
                let chunks = self.parse_update_file(text)?;
                self.actions
                    .push((path, PatchAction::Update { chunks, move_path }));
                continue;
            }

            if let Some(path) = self.read_str(DELETE_FILE) {
                if self.has_action(&path) {
                    return Err(PatchError::new(format!("Duplicate delete for file: {path}")));
                }
                if !self.current_files.contains_key(&path) {
                    return Err(PatchError::new(format!(
                        "Delete File Error - missing file: {path}"
                    )));
                }
                self.actions.push((path, PatchAction::Delete));
                continue;
            }

            if let Some(path) = self.read_str(ADD_FILE) {
                if self.has_action(&path) {
                    return Err(PatchError::new(format!("Duplicate add for file: {path}")));
                }
                if self.current_files.contains_key(&path) {
                    return Err(PatchError::new(format!(
                        "Add File Error - file already exists: {path}"
                    )));
                }
                let content = self.parse_add_file()?;
                self.actions.push((path, PatchAction::Add { content }));
                continue;
            }

            let line = self.cur_line().unwrap_or_default().to_string();
            return Err(PatchError::new(format!("Unknown line while parsing: {line}")));
        }

        if !self.starts_with(END_PATCH) {
            return Err(PatchError::new("Missing *** End Patch sentinel"));
        }
        self.index += 1;
        Ok(())
    }

    fn parse_update_file(&mut self, text: &str) -> Result<Vec<Chunk>> {
        let file_lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let mut index = 0usize;
        let mut chunks: Vec<Chunk> = Vec::new();

        let mut hunk_ends = SECTION_ENDS.to_vec();
        hunk_ends.push(END_OF_FILE);

        while !self.is_done(&hunk_ends) {
            let mut section_str = String::new();
            let def_str = match self.read_str("@@ ") {
                Some(def) => def,
                None => {
                    if norm(self.cur_line()?) == "@@" {
                        section_str = self.read_line()?;
                    }
                    String::new()
                }
            };

            if def_str.is_empty() && section_str.is_empty() && index != 0 {
                let line = self.cur_line().unwrap_or_default();
                return Err(PatchError::new(format!(
                    "Invalid line in update section:\n{line}"
                )));
            }

            if !def_str.trim().is_empty() {
                let mut found = false;
                if !file_lines[..index].iter().any(|l| *l == def_str) {
                    for (i, line) in file_lines.iter().enumerate().skip(index) {
                        if *line == def_str {
                            index = i + 1;
                            found = true;
                            break;
                        }
                    }
                }
                if !found
                    && !file_lines[..index]
                        .iter()
                        .any(|l| l.trim() == def_str.trim())
                {
                    for (i, line) in file_lines.iter().enumerate().skip(index) {
                        if line.trim() == def_str.trim() {
                            index = i + 1;
                            self.fuzz += 1;
                            break;
                        }
                    }
                }
                // Not finding the definition is fine; context decides below.
            }

            let (next_ctx, section_chunks, end_idx, eof) =
                peek_next_section(&self.lines, self.index)?;
            let Some((new_index, fuzz)) = seek_context(&file_lines, &next_ctx, index, eof) else {
                let ctx_text = next_ctx.join("\n");
                let prefix = if eof { "EOF " } else { "" };
                return Err(PatchError::new(format!(
                    "Invalid {prefix}context at {index}:\n{ctx_text}"
                )));
            };
            self.fuzz += fuzz;
            for mut chunk in section_chunks {
                chunk.orig_index += new_index;
                chunks.push(chunk);
            }
            index = new_index + next_ctx.len();
            self.index = end_idx;
        }
        Ok(chunks)
    }

    fn parse_add_file(&mut self) -> Result<String> {
        let mut lines: Vec<String> = Vec::new();
        while !self.is_done(SECTION_ENDS) {
            let line = self.read_line()?;
            let Some(content) = line.strip_prefix('+') else {
                return Err(PatchError::new(format!(
                    "Invalid Add File line (missing '+'): {line}"
                )));
            };
            lines.push(content.to_string());
        }
        Ok(lines.join("\n"))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Keep,
    Add,
    Delete,
}

/// Reads one hunk body: context lines plus interleaved delete/insert runs.
/// Returns the context (the original lines the hunk spans), the chunks keyed
/// relative to the context start, the line index just past the hunk, and
/// whether the hunk is EOF-anchored.
fn peek_next_section(
    lines: &[String],
    start: usize,
) -> Result<(Vec<String>, Vec<Chunk>, usize, bool)> {
    let mut old: Vec<String> = Vec::new();
    let mut del_lines: Vec<String> = Vec::new();
    let mut ins_lines: Vec<String> = Vec::new();
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut mode = Mode::Keep;
    let mut index = start;

    while index < lines.len() {
        let raw = &lines[index];
        let s = norm(raw);
        if s.starts_with("@@")
            || s.starts_with(END_PATCH)
            || s.starts_with("*** Update File:")
            || s.starts_with("*** Delete File:")
            || s.starts_with("*** Add File:")
            || s.starts_with(END_OF_FILE)
        {
            break;
        }
        if s == "***" {
            break;
        }
        if s.starts_with("***") {
            return Err(PatchError::new(format!("Invalid Line: {raw}")));
        }
        index += 1;

        let last_mode = mode;
        // Hunk markers come from the raw line so leading +/-/space is read
        // correctly; an empty line counts as blank context.
        let line = if raw.is_empty() { " " } else { raw.as_str() };
        mode = match line.as_bytes()[0] {
            b'+' => Mode::Add,
            b'-' => Mode::Delete,
            b' ' => Mode::Keep,
            _ => return Err(PatchError::new(format!("Invalid Line: {raw}"))),
        };
        let line = &line[1..];

        if mode == Mode::Keep && last_mode != mode && (!ins_lines.is_empty() || !del_lines.is_empty())
        {
            chunks.push(Chunk {
                orig_index: old.len() - del_lines.len(),
                del_lines: std::mem::take(&mut del_lines),
                ins_lines: std::mem::take(&mut ins_lines),
            });
        }

        match mode {
            Mode::Delete => {
                del_lines.push(line.to_string());
                old.push(line.to_string());
            }
            Mode::Add => ins_lines.push(line.to_string()),
            Mode::Keep => old.push(line.to_string()),
        }
    }

    if !ins_lines.is_empty() || !del_lines.is_empty() {
        chunks.push(Chunk {
            orig_index: old.len() - del_lines.len(),
            del_lines,
            ins_lines,
        });
    }

    if index < lines.len() && norm(&lines[index]) == END_OF_FILE {
        index += 1;
        return Ok((old, chunks, index, true));
    }

    if index == start {
        return Err(PatchError::new("Nothing in this section"));
    }
    Ok((old, chunks, index, false))
}

/// Parses full patch text against the current file contents, returning the
/// ordered actions and the accumulated fuzz score.
pub fn text_to_patch(text: &str, orig: &HashMap<String, String>) -> Result<(Patch, u64)> {
    let lines = split_lines(text);
    let sentinels_ok = lines.len() >= 2
        && norm(&lines[0]).starts_with(BEGIN_PATCH)
        && lines.last().map(|l| norm(l)) == Some(END_PATCH);
    if !sentinels_ok {
        return Err(PatchError::new("Invalid patch text - missing sentinels"));
    }

    let mut parser = Parser {
        current_files: orig,
        lines,
        index: 1,
        actions: Vec::new(),
        fuzz: 0,
    };
    parser.parse()?;
    Ok((
        Patch {
            actions: parser.actions,
        },
        parser.fuzz,
    ))
}

//! Unified diff parsing.
//!
//! Accepts the `diff --git` dialect produced by change generators: add, modify,
//! and delete of text files through context-matched hunks. Renames, copies, and
//! binary payloads are rejected at parse time so nothing downstream has to
//! reason about them.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{ErrorKind, PipelineError};

static FILE_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git a/(\S+) b/(\S+)$").expect("file header regex"));

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@(?: .*)?$").expect("hunk header regex")
});

const DEV_NULL: &str = "/dev/null";

/// One line of a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Add(String),
    Remove(String),
}

/// A contiguous region of change in one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
    /// The pre-image ends inside this hunk without a trailing newline.
    pub no_newline_old: bool,
    /// The post-image ends inside this hunk without a trailing newline.
    pub no_newline_new: bool,
}

impl Hunk {
    /// `(added, removed)` line counts.
    pub fn stats(&self) -> (usize, usize) {
        self.lines.iter().fold((0, 0), |(add, remove), line| match line {
            HunkLine::Add(_) => (add + 1, remove),
            HunkLine::Remove(_) => (add, remove + 1),
            HunkLine::Context(_) => (add, remove),
        })
    }
}

/// Path marker from a `---` / `+++` line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Marker {
    /// No marker line was present for this side.
    #[default]
    Missing,
    /// The side does not exist (`/dev/null`).
    DevNull,
    Path(String),
}

/// All changes to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// Old path from the `diff --git a/<old> b/<new>` header.
    pub git_old: String,
    /// New path from the `diff --git` header.
    pub git_new: String,
    pub old_marker: Marker,
    pub new_marker: Marker,
    pub is_new_file: bool,
    pub is_deleted_file: bool,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    fn new(git_old: String, git_new: String) -> Self {
        Self {
            git_old,
            git_new,
            old_marker: Marker::Missing,
            new_marker: Marker::Missing,
            is_new_file: false,
            is_deleted_file: false,
            hunks: Vec::new(),
        }
    }

    /// Path of the pre-image, preferring the `---` marker over the header.
    pub fn old_path(&self) -> Option<&str> {
        resolve_side(&self.old_marker, &self.git_old)
    }

    /// Path of the post-image, preferring the `+++` marker over the header.
    pub fn new_path(&self) -> Option<&str> {
        resolve_side(&self.new_marker, &self.git_new)
    }

    /// True when this file patch removes its target.
    pub fn is_delete(&self) -> bool {
        self.is_deleted_file || self.new_marker == Marker::DevNull || self.new_path().is_none()
    }

    /// Path this patch mutates (new path for add/modify, old path for delete).
    pub fn target_path(&self) -> Option<&str> {
        if self.is_delete() {
            self.old_path()
        } else {
            self.new_path()
        }
    }
}

fn resolve_side<'a>(marker: &'a Marker, header: &'a str) -> Option<&'a str> {
    match marker {
        Marker::Path(path) => Some(path.as_str()),
        Marker::DevNull => None,
        Marker::Missing if header.is_empty() => None,
        Marker::Missing => Some(header),
    }
}

/// A parsed diff: one or more file patches in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub files: Vec<FilePatch>,
}

impl Patch {
    /// Target paths in input order (duplicates preserved).
    pub fn target_paths(&self) -> Vec<&str> {
        self.files.iter().filter_map(FilePatch::target_path).collect()
    }
}

/// Hunk body bookkeeping while parsing.
struct OpenHunk {
    hunk: Hunk,
    old_seen: usize,
    new_seen: usize,
}

impl OpenHunk {
    fn is_complete(&self) -> bool {
        self.old_seen == self.hunk.old_count && self.new_seen == self.hunk.new_count
    }
}

/// Parse unified diff text into a [`Patch`].
///
/// Hunk bodies are delimited by the header counts: once a hunk has consumed
/// `old_count` pre-image lines and `new_count` post-image lines, the next line
/// must be a hunk header, a file header, or blank.
pub fn parse_patch(text: &str) -> Result<Patch, PipelineError> {
    if text.trim().is_empty() {
        return Err(parse_error("empty diff"));
    }

    let mut files: Vec<FilePatch> = Vec::new();
    let mut current: Option<FilePatch> = None;
    let mut open: Option<OpenHunk> = None;

    for (idx, line) in text.lines().enumerate() {
        let lineno = idx + 1;

        if let Some(hunk) = open.as_mut()
            && line.starts_with("\\ ")
        {
            mark_no_newline(hunk, lineno)?;
            continue;
        }

        if let Some(hunk) = open.as_mut()
            && !hunk.is_complete()
        {
            if line.starts_with("diff --git ") || HUNK_HEADER_RE.is_match(line) {
                return Err(parse_error(format!(
                    "line {lineno}: hunk ended early (expected -{} +{} lines, saw -{} +{})",
                    hunk.hunk.old_count, hunk.hunk.new_count, hunk.old_seen, hunk.new_seen
                )));
            }
            push_body_line(hunk, line, lineno)?;
            continue;
        }

        if let Some(caps) = FILE_HEADER_RE.captures(line) {
            close_hunk(&mut current, &mut open);
            if let Some(done) = current.take() {
                files.push(finish_file(done)?);
            }
            current = Some(FilePatch::new(caps[1].to_string(), caps[2].to_string()));
            continue;
        }
        if line.starts_with("diff --git ") {
            return Err(parse_error(format!(
                "line {lineno}: malformed file header '{line}'"
            )));
        }

        if let Some(caps) = HUNK_HEADER_RE.captures(line) {
            close_hunk(&mut current, &mut open);
            if current.is_none() {
                return Err(parse_error(format!(
                    "line {lineno}: hunk header before any file header"
                )));
            }
            open = Some(OpenHunk {
                hunk: Hunk {
                    old_start: parse_number(&caps, 1, lineno)?,
                    old_count: parse_count(&caps, 2, lineno)?,
                    new_start: parse_number(&caps, 3, lineno)?,
                    new_count: parse_count(&caps, 4, lineno)?,
                    lines: Vec::new(),
                    no_newline_old: false,
                    no_newline_new: false,
                },
                old_seen: 0,
                new_seen: 0,
            });
            continue;
        }
        if line.starts_with("@@") {
            return Err(parse_error(format!(
                "line {lineno}: malformed hunk header '{line}'"
            )));
        }

        if line.starts_with("\\ ") || line.trim().is_empty() {
            continue;
        }

        let Some(file) = current.as_mut() else {
            // Preamble before the first file header (commit message, prose).
            continue;
        };

        if open.is_some() {
            return Err(parse_error(format!(
                "line {lineno}: line after complete hunk is not a header: '{line}'"
            )));
        }
        parse_extended_header(file, line, lineno)?;
    }

    if let Some(hunk) = &open
        && !hunk.is_complete()
    {
        return Err(parse_error(format!(
            "unexpected end of diff inside hunk @@ -{},{} +{},{} @@",
            hunk.hunk.old_start, hunk.hunk.old_count, hunk.hunk.new_start, hunk.hunk.new_count
        )));
    }
    close_hunk(&mut current, &mut open);
    if let Some(done) = current.take() {
        files.push(finish_file(done)?);
    }

    if files.is_empty() {
        return Err(parse_error("diff contains no file sections"));
    }
    Ok(Patch { files })
}

fn parse_extended_header(file: &mut FilePatch, line: &str, lineno: usize) -> Result<(), PipelineError> {
    if line.starts_with("new file mode") {
        file.is_new_file = true;
    } else if line.starts_with("deleted file mode") {
        file.is_deleted_file = true;
    } else if let Some(rest) = line.strip_prefix("--- ") {
        file.old_marker = parse_marker(rest, "a/");
    } else if let Some(rest) = line.strip_prefix("+++ ") {
        file.new_marker = parse_marker(rest, "b/");
    } else if line.starts_with("rename from")
        || line.starts_with("rename to")
        || line.starts_with("copy from")
        || line.starts_with("copy to")
        || line.starts_with("similarity index")
    {
        return Err(parse_error(format!(
            "line {lineno}: renames and copies are not supported"
        )));
    } else if line.starts_with("Binary files") || line.starts_with("GIT binary patch") {
        return Err(parse_error(format!(
            "line {lineno}: binary patches are not supported"
        )));
    } else if line.starts_with("index ")
        || line.starts_with("old mode")
        || line.starts_with("new mode")
        || line.starts_with("dissimilarity index")
    {
        // Metadata with no effect on content.
    } else {
        return Err(parse_error(format!(
            "line {lineno}: unexpected line in file header: '{line}'"
        )));
    }
    Ok(())
}

fn push_body_line(open: &mut OpenHunk, line: &str, lineno: usize) -> Result<(), PipelineError> {
    let mut chars = line.chars();
    let tag = chars.next();
    let body = chars.as_str().to_string();
    let entry = match tag {
        Some(' ') => {
            open.old_seen += 1;
            open.new_seen += 1;
            HunkLine::Context(body)
        }
        Some('-') => {
            open.old_seen += 1;
            HunkLine::Remove(body)
        }
        Some('+') => {
            open.new_seen += 1;
            HunkLine::Add(body)
        }
        _ => {
            return Err(parse_error(format!(
                "line {lineno}: hunk line must start with ' ', '+', or '-': '{line}'"
            )));
        }
    };
    if open.old_seen > open.hunk.old_count || open.new_seen > open.hunk.new_count {
        return Err(parse_error(format!(
            "line {lineno}: hunk body exceeds header counts -{} +{}",
            open.hunk.old_count, open.hunk.new_count
        )));
    }
    open.hunk.lines.push(entry);
    Ok(())
}

/// `\ No newline at end of file` applies to the side(s) of the line before it.
fn mark_no_newline(open: &mut OpenHunk, lineno: usize) -> Result<(), PipelineError> {
    match open.hunk.lines.last() {
        Some(HunkLine::Context(_)) => {
            open.hunk.no_newline_old = true;
            open.hunk.no_newline_new = true;
        }
        Some(HunkLine::Remove(_)) => open.hunk.no_newline_old = true,
        Some(HunkLine::Add(_)) => open.hunk.no_newline_new = true,
        None => {
            return Err(parse_error(format!(
                "line {lineno}: end-of-file marker before any hunk line"
            )));
        }
    }
    Ok(())
}

fn close_hunk(current: &mut Option<FilePatch>, open: &mut Option<OpenHunk>) {
    if let (Some(file), Some(done)) = (current.as_mut(), open.take()) {
        file.hunks.push(done.hunk);
    }
}

fn finish_file(file: FilePatch) -> Result<FilePatch, PipelineError> {
    if file.hunks.is_empty() && !file.is_new_file && !file.is_deleted_file {
        return Err(parse_error(format!(
            "file section for '{}' has no hunks",
            file.git_new
        )));
    }
    Ok(file)
}

fn parse_marker(rest: &str, prefix: &str) -> Marker {
    let raw = rest.split('\t').next().unwrap_or_default().trim_end();
    if raw == DEV_NULL {
        return Marker::DevNull;
    }
    let path = raw.strip_prefix(prefix).unwrap_or(raw);
    Marker::Path(path.to_string())
}

fn parse_number(caps: &regex::Captures<'_>, group: usize, lineno: usize) -> Result<usize, PipelineError> {
    caps[group]
        .parse()
        .map_err(|_| parse_error(format!("line {lineno}: hunk number out of range")))
}

fn parse_count(caps: &regex::Captures<'_>, group: usize, lineno: usize) -> Result<usize, PipelineError> {
    match caps.get(group) {
        Some(_) => parse_number(caps, group, lineno),
        None => Ok(1),
    }
}

fn parse_error(message: impl Into<String>) -> PipelineError {
    PipelineError::new(ErrorKind::Parse, message)
}

//! Task record parser.
//!
//! Records are markdown files. Only four things are read from them: the
//! id/title heading, the dependency list, the verification commands and the
//! acceptance checklist. Everything else is description prose.
//!
//! ```text
//! # api-schema: Define the API schema
//!
//! Free-form description.
//!
//! ## Dependencies
//! - db-models
//!
//! ## Verification
//! - `cargo test -p api`
//!
//! ## Acceptance Criteria
//! - [ ] schema is versioned
//! - [x] types are generated
//! ```
//!
//! The dependency list may also be written inline as `Dependencies: a, b`
//! (or `Dependencies: none`), and the id as `ID: api`. Inline fields are
//! only read directly under the title heading; the same words further down
//! are prose. Dependency entries that are not slugs, are
//! repeated, or name the task itself fail the parse with the offending line.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::core::task::{is_valid_slug, Criterion, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Description,
    Dependencies,
    Verification,
    Acceptance,
    Other,
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^#\s+(?:(?P<id>[A-Za-z0-9][A-Za-z0-9._-]*)\s*:\s+)?(?P<title>.+?)\s*$")
            .expect("static regex")
    })
}

fn field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?i)(?P<key>id|dependencies|depends on)\s*:\s*(?P<value>.*?)\s*$")
            .expect("static regex")
    })
}

fn checkbox_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[(?P<mark>.?)\]\s*(?P<text>.*)$").expect("static regex"))
}

struct Parser<'a> {
    path: &'a Path,
    stem: Option<String>,
    id: Option<TaskId>,
    title: Option<String>,
    description: Vec<&'a str>,
    dependencies: Vec<TaskId>,
    verification: Vec<String>,
    criteria: Vec<Criterion>,
    in_fence: bool,
}

impl<'a> Parser<'a> {
    fn error(&self, line: usize, reason: impl Into<String>) -> Error {
        Error::Parse {
            path: self.path.to_path_buf(),
            line,
            reason: reason.into(),
        }
    }

    fn set_id(&mut self, line: usize, raw: &str) -> Result<()> {
        let id = TaskId::new(raw).map_err(|_| self.error(line, format!("invalid task id {:?}", raw)))?;
        if let Some(existing) = &self.id {
            if existing != &id {
                return Err(self.error(
                    line,
                    format!("conflicting ids {} and {}", existing, id),
                ));
            }
        }
        self.id = Some(id);
        Ok(())
    }

    fn add_dependency(&mut self, line: usize, raw: &str) -> Result<()> {
        let entry = raw.trim().trim_matches('`').trim();
        if entry.is_empty() {
            return Err(self.error(line, "empty dependency entry"));
        }
        if !is_valid_slug(entry) {
            return Err(self.error(line, format!("dependency {:?} is not a task id", entry)));
        }
        let dep = TaskId::new(entry).map_err(|e| self.error(line, e.to_string()))?;
        if self.dependencies.contains(&dep) {
            return Err(self.error(line, format!("dependency {} listed twice", dep)));
        }
        self.dependencies.push(dep);
        Ok(())
    }

    fn inline_dependencies(&mut self, line: usize, value: &str) -> Result<()> {
        if is_none_marker(value) {
            return Ok(());
        }
        for entry in value.split(',') {
            self.add_dependency(line, entry)?;
        }
        Ok(())
    }

    fn list_line(&mut self, section: Section, line: usize, item: &'a str) -> Result<()> {
        match section {
            Section::Dependencies => {
                if is_none_marker(item) && self.dependencies.is_empty() {
                    return Ok(());
                }
                self.add_dependency(line, item)
            }
            Section::Verification => {
                let command = strip_code(item);
                if !command.is_empty() {
                    self.verification.push(command.to_string());
                }
                Ok(())
            }
            Section::Acceptance => {
                let criterion = match checkbox_re().captures(item) {
                    Some(caps) => {
                        let done = match &caps["mark"] {
                            " " | "" => false,
                            "x" | "X" => true,
                            other => {
                                return Err(self.error(
                                    line,
                                    format!("unknown checklist marker [{}]", other),
                                ))
                            }
                        };
                        Criterion {
                            text: caps["text"].trim().to_string(),
                            done,
                        }
                    }
                    None => Criterion::new(item.trim()),
                };
                self.criteria.push(criterion);
                Ok(())
            }
            Section::Description => {
                self.description.push(item);
                Ok(())
            }
            Section::Other => Ok(()),
        }
    }
}

fn is_none_marker(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v == "-" || v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("n/a")
}

fn strip_code(item: &str) -> &str {
    item.trim().trim_matches('`').trim()
}

fn section_for(title: &str) -> Section {
    let lower = title.trim().to_ascii_lowercase();
    match lower.as_str() {
        "dependencies" | "depends on" => Section::Dependencies,
        "verification" | "verification commands" => Section::Verification,
        "acceptance criteria" | "acceptance" => Section::Acceptance,
        _ => Section::Other,
    }
}

/// Parse one task record.
///
/// `path` is used for diagnostics and its file stem supplies the id when the
/// record does not declare one. A declared id must equal the file stem.
pub fn parse_record(path: &Path, text: &str, status: TaskStatus) -> Result<Task> {
    let mut parser = Parser {
        path,
        stem: path.file_stem().and_then(|s| s.to_str()).map(String::from),
        id: None,
        title: None,
        description: Vec::new(),
        dependencies: Vec::new(),
        verification: Vec::new(),
        criteria: Vec::new(),
        in_fence: false,
    };
    let mut section = Section::Description;
    // inline fields are only read between the title and the first prose line
    let mut in_header = true;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();

        if trimmed.starts_with("```") {
            in_header = false;
            parser.in_fence = !parser.in_fence;
            if section == Section::Description {
                parser.description.push(raw);
            }
            continue;
        }
        if parser.in_fence {
            match section {
                Section::Verification if !trimmed.is_empty() && !trimmed.starts_with('#') => {
                    parser.verification.push(trimmed.to_string());
                }
                Section::Description => parser.description.push(raw),
                _ => {}
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("## ") {
            in_header = false;
            section = section_for(rest);
            continue;
        }

        if parser.title.is_none() && trimmed.starts_with("# ") {
            if let Some(caps) = heading_re().captures(trimmed) {
                // `# Fix: typo` in fix-typo.md is a title, not an id
                match caps.name("id") {
                    Some(id) if parser.stem.as_deref().map_or(true, |s| s == id.as_str()) => {
                        parser.set_id(line, id.as_str())?;
                        parser.title = Some(caps["title"].to_string());
                    }
                    _ => parser.title = Some(trimmed[2..].trim().to_string()),
                }
                continue;
            }
        }

        if let Some(caps) = field_re().captures(trimmed).filter(|_| in_header) {
            let value = caps.name("value").map_or("", |m| m.as_str());
            if caps["key"].eq_ignore_ascii_case("id") {
                parser.set_id(line, value)?;
            } else {
                parser.inline_dependencies(line, value)?;
            }
            continue;
        }

        if section == Section::Description {
            in_header &= trimmed.is_empty();
            parser.description.push(raw);
            continue;
        }

        if let Some(item) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
        {
            parser.list_line(section, line, item)?;
        } else if trimmed == "-" || trimmed == "*" {
            if section == Section::Dependencies {
                return Err(parser.error(line, "empty dependency entry"));
            }
        } else if section == Section::Dependencies && !trimmed.is_empty() {
            return Err(parser.error(
                line,
                format!("expected a '- <task-id>' list item, found {:?}", trimmed),
            ));
        }
    }

    let id = match (parser.id.take(), parser.stem.as_deref()) {
        (Some(id), Some(stem)) if id.as_str() != stem => {
            return Err(parser.error(
                1,
                format!("declared id {} does not match file name {}", id, stem),
            ))
        }
        (Some(id), _) => id,
        (None, Some(stem)) => {
            TaskId::new(stem).map_err(|_| parser.error(1, format!("file name {:?} is not a task id", stem)))?
        }
        (None, None) => return Err(parser.error(1, "record has no id")),
    };

    if parser.dependencies.contains(&id) {
        return Err(parser.error(1, format!("task {} depends on itself", id)));
    }

    let title = parser.title.take().unwrap_or_else(|| id.to_string());
    let description = parser.description.join("\n").trim().to_string();

    Ok(Task {
        id,
        title,
        description,
        dependencies: parser.dependencies,
        verification: parser.verification,
        acceptance_criteria: parser.criteria,
        status,
        blocked_reason: None,
    })
}

/// Render a task in the record format accepted by [`parse_record`].
pub fn render_record(task: &Task) -> String {
    let mut out = format!("# {}: {}\n", task.id, task.title);
    if !task.description.is_empty() {
        out.push('\n');
        out.push_str(&task.description);
        out.push('\n');
    }

    out.push_str("\n## Dependencies\n");
    if task.dependencies.is_empty() {
        out.push_str("- none\n");
    }
    for dep in &task.dependencies {
        out.push_str(&format!("- {}\n", dep));
    }

    if !task.verification.is_empty() {
        out.push_str("\n## Verification\n");
        for command in &task.verification {
            out.push_str(&format!("- `{}`\n", command));
        }
    }

    if !task.acceptance_criteria.is_empty() {
        out.push_str("\n## Acceptance Criteria\n");
        for criterion in &task.acceptance_criteria {
            let mark = if criterion.done { "x" } else { " " };
            out.push_str(&format!("- [{}] {}\n", mark, criterion.text));
        }
    }
    out
}

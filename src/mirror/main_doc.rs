//! Structured model of the root memory document (`main.md`).
//!
//! The document is parsed into a preamble and a flat list of `##` / `###`
//! sections, each holding ordered [`Line`]s. Edits operate on the model and
//! [`MainDocument::render`] writes it back in a canonical layout:
//!
//! - one blank line between blocks, none at section edges;
//! - a `---` rule before every `##` section except the first.
//!
//! `render(parse(t))` may normalize spacing once; after that it is a fixed
//! point. Lines inside fenced code blocks are kept verbatim.

use chrono::NaiveDate;
use std::fmt;

use crate::error::{Error, Result};
use crate::models::Category;

pub const FILE_INDEX: &str = "File Index";
pub const CURRENT_GOALS: &str = "Current Goals";
pub const COMPLETED_TASKS: &str = "Completed Tasks";
pub const PLANS: &str = "Plans";
pub const FUTURE_PLANS: &str = "Future Plans";
pub const RECENT_NOTES: &str = "Recent Notes";
pub const QUICK_REFERENCE: &str = "Quick Reference";

/// Link targets in the File Index are `/memory_files/<path>`.
pub const LINK_PREFIX: &str = "/memory_files/";

const LAST_UPDATED: &str = "Last Updated:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Open,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// `- [ ] text` or `- [x] text`
    Task { state: TaskState, text: String },
    /// `- [title](target) - description`
    Link {
        title: String,
        target: String,
        description: String,
    },
    /// `- text`
    Bullet(String),
    /// Anything else, including blank lines and HTML comments.
    Text(String),
}

impl Line {
    pub fn parse(raw: &str) -> Line {
        let line = raw.trim_end();
        if let Some(text) = line.strip_prefix("- [ ] ") {
            return Line::Task {
                state: TaskState::Open,
                text: text.to_string(),
            };
        }
        if let Some(text) = line
            .strip_prefix("- [x] ")
            .or_else(|| line.strip_prefix("- [X] "))
        {
            return Line::Task {
                state: TaskState::Done,
                text: text.to_string(),
            };
        }
        if let Some(link) = parse_link(line) {
            return link;
        }
        if let Some(text) = line.strip_prefix("- ") {
            return Line::Bullet(text.to_string());
        }
        Line::Text(line.to_string())
    }

    fn is_blank(&self) -> bool {
        matches!(self, Line::Text(t) if t.trim().is_empty())
    }
}

fn parse_link(line: &str) -> Option<Line> {
    let rest = line.strip_prefix("- [")?;
    let title_end = rest.find("](")?;
    let after = &rest[title_end + 2..];
    let target_end = after.find(')')?;
    let tail = &after[target_end + 1..];
    let description = if tail.is_empty() {
        ""
    } else {
        tail.strip_prefix(" - ")?
    };
    Some(Line::Link {
        title: rest[..title_end].to_string(),
        target: after[..target_end].to_string(),
        description: description.to_string(),
    })
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Task {
                state: TaskState::Open,
                text,
            } => write!(f, "- [ ] {}", text),
            Line::Task {
                state: TaskState::Done,
                text,
            } => write!(f, "- [x] {}", text),
            Line::Link {
                title,
                target,
                description,
            } if description.is_empty() => write!(f, "- [{}]({})", title, target),
            Line::Link {
                title,
                target,
                description,
            } => write!(f, "- [{}]({}) - {}", title, target, description),
            Line::Bullet(text) => write!(f, "- {}", text),
            Line::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// 2 for `##`, 3 for `###`.
    pub level: usize,
    pub title: String,
    pub lines: Vec<Line>,
}

impl Section {
    fn new(level: usize, title: &str) -> Self {
        Self {
            level,
            title: title.to_string(),
            lines: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MainDocument {
    /// Lines before the first section (title, `Last Updated:`).
    pub preamble: Vec<Line>,
    pub sections: Vec<Section>,
}

impl MainDocument {
    /// The initial root document.
    pub fn template(today: NaiveDate) -> Self {
        let mut text = format!(
            "# Agent Memory - Main Notes\n\n{} {}\n\n## {}\n\n\
             This section maintains an index of all specialized memory files with descriptions.\n",
            LAST_UPDATED,
            today.format("%Y-%m-%d"),
            FILE_INDEX
        );
        for category in Category::ALL {
            if category == Category::Main {
                continue;
            }
            text.push_str(&format!(
                "\n### {}\n\n<!-- Add {} files here -->\n",
                category.index_heading(),
                category.as_str()
            ));
        }
        for (title, hint) in [
            (CURRENT_GOALS, "Active goals that the agent is working towards"),
            (COMPLETED_TASKS, "Tasks that have been completed with dates"),
            (PLANS, "Plans currently in progress"),
            (FUTURE_PLANS, "Long-term plans and ideas for the future"),
            (RECENT_NOTES, "Recent session notes and important observations"),
            (QUICK_REFERENCE, "Quick access to frequently needed information"),
        ] {
            text.push_str(&format!("\n---\n\n## {}\n\n<!-- {} -->\n", title, hint));
        }
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Self {
        let mut doc = MainDocument::default();
        let mut in_fence = false;

        for raw in text.lines() {
            let line = raw.trim_end();
            let target = match doc.sections.last_mut() {
                Some(section) => &mut section.lines,
                None => &mut doc.preamble,
            };
            if is_fence(line) {
                in_fence = !in_fence;
                target.push(Line::Text(line.to_string()));
                continue;
            }
            if in_fence {
                target.push(Line::Text(line.to_string()));
                continue;
            }
            if line == "---" {
                continue;
            }
            if let Some((level, title)) = section_heading(line) {
                doc.sections.push(Section::new(level, title));
                continue;
            }
            target.push(Line::parse(line));
        }

        trim_blank(&mut doc.preamble);
        for section in &mut doc.sections {
            trim_blank(&mut section.lines);
        }
        doc
    }

    pub fn render(&self) -> String {
        let mut blocks: Vec<String> = Vec::new();
        if !self.preamble.is_empty() {
            blocks.push(join_lines(&self.preamble));
        }
        for (i, section) in self.sections.iter().enumerate() {
            if section.level == 2 && i > 0 {
                blocks.push("---".to_string());
            }
            let mut block = format!("{} {}", "#".repeat(section.level), section.title);
            if !section.lines.is_empty() {
                block.push_str("\n\n");
                block.push_str(&join_lines(&section.lines));
            }
            blocks.push(block);
        }
        let mut out = blocks.join("\n\n");
        out.push('\n');
        out
    }

    pub fn section(&self, title: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.title.eq_ignore_ascii_case(title))
    }

    fn section_mut(&mut self, title: &str) -> Result<&mut Section> {
        self.sections
            .iter_mut()
            .find(|s| s.title.eq_ignore_ascii_case(title))
            .ok_or_else(|| Error::NotFound(format!("section '{}' in main document", title)))
    }

    /// Set the `Last Updated:` line, adding it under the title if absent.
    pub fn touch(&mut self, today: NaiveDate) {
        let stamp = Line::Text(format!("{} {}", LAST_UPDATED, today.format("%Y-%m-%d")));
        if let Some(line) = self
            .preamble
            .iter_mut()
            .find(|l| matches!(l, Line::Text(t) if t.starts_with(LAST_UPDATED)))
        {
            *line = stamp;
            return;
        }
        let at = match self.preamble.first() {
            Some(Line::Text(t)) if t.starts_with("# ") => 1,
            _ => 0,
        };
        if at == 1 {
            self.preamble.insert(1, Line::Text(String::new()));
            self.preamble.insert(2, stamp);
        } else {
            self.preamble.insert(0, stamp);
        }
    }

    /// Append free-form content to a section, separated by a blank line.
    ///
    /// Note lines that would read back as a section heading or a rule are
    /// backslash-escaped, and a fence the note leaves open is closed, so the
    /// note stays inside its section.
    pub fn append_note(&mut self, section: &str, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::Validation("note content must not be empty".to_string()));
        }
        let section = self.section_mut(section)?;
        if !section.lines.is_empty() {
            section.lines.push(Line::Text(String::new()));
        }
        section.lines.extend(note_lines(content));
        Ok(())
    }

    pub fn add_goal(&mut self, goal: &str) -> Result<()> {
        self.push_task(CURRENT_GOALS, TaskState::Open, goal)
    }

    /// Remove an open goal and record it under Completed Tasks.
    pub fn complete_goal(&mut self, goal: &str, today: NaiveDate) -> Result<()> {
        let goal = goal.trim();
        let goals = self.section_mut(CURRENT_GOALS)?;
        let at = find_open(&goals.lines, goal)
            .ok_or_else(|| Error::NotFound(format!("open goal '{}'", goal)))?;
        goals.lines.remove(at);
        self.push_task(COMPLETED_TASKS, TaskState::Done, &completed(goal, today))
    }

    /// Record a task as done.
    pub fn add_task(&mut self, task: &str, today: NaiveDate) -> Result<()> {
        let task = single_line(task)?;
        self.push_task(COMPLETED_TASKS, TaskState::Done, &completed(task, today))
    }

    pub fn add_plan(&mut self, plan: &str) -> Result<()> {
        self.push_task(PLANS, TaskState::Open, plan)
    }

    /// Mark an open plan done in place.
    pub fn complete_plan(&mut self, plan: &str, today: NaiveDate) -> Result<()> {
        let plan = plan.trim();
        let plans = self.section_mut(PLANS)?;
        let at = find_open(&plans.lines, plan)
            .ok_or_else(|| Error::NotFound(format!("open plan '{}'", plan)))?;
        plans.lines[at] = Line::Task {
            state: TaskState::Done,
            text: completed(plan, today),
        };
        Ok(())
    }

    pub fn add_future_plan(&mut self, plan: &str) -> Result<()> {
        let plan = single_line(plan)?;
        let section = self.section_mut(FUTURE_PLANS)?;
        insert_item(&mut section.lines, Line::Bullet(plan.to_string()));
        Ok(())
    }

    /// Open items of a task section, in document order.
    pub fn open_items(&self, section: &str) -> Vec<&str> {
        self.section(section)
            .map(|s| {
                s.lines
                    .iter()
                    .filter_map(|l| match l {
                        Line::Task {
                            state: TaskState::Open,
                            text,
                        } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Add or replace the File Index link for `path`.
    ///
    /// A link to the same path under another category heading is removed.
    pub fn upsert_link(
        &mut self,
        category: Category,
        title: &str,
        path: &str,
        description: &str,
    ) -> Result<()> {
        if category == Category::Main {
            return Ok(());
        }
        self.remove_link(path);
        let link = Line::Link {
            title: title.to_string(),
            target: format!("{}{}", LINK_PREFIX, path),
            description: description.split_whitespace().collect::<Vec<_>>().join(" "),
        };
        let at = self.index_subsection(category)?;
        let lines = &mut self.sections[at].lines;
        let insert_at = lines
            .iter()
            .rposition(|l| matches!(l, Line::Link { .. }))
            .map(|i| i + 1)
            .unwrap_or(0);
        lines.insert(insert_at, link);
        Ok(())
    }

    /// Remove the File Index link for `path`, if any.
    pub fn remove_link(&mut self, path: &str) -> bool {
        let target = format!("{}{}", LINK_PREFIX, path);
        let mut removed = false;
        for section in self.file_index_sections_mut() {
            let before = section.lines.len();
            section
                .lines
                .retain(|l| !matches!(l, Line::Link { target: t, .. } if *t == target));
            removed |= section.lines.len() != before;
        }
        removed
    }

    /// Every linked path in the File Index.
    pub fn linked_paths(&self) -> Vec<String> {
        let Some(start) = self.file_index_start() else {
            return Vec::new();
        };
        self.sections[start..]
            .iter()
            .enumerate()
            .take_while(|(i, s)| *i == 0 || s.level > 2)
            .flat_map(|(_, s)| s.lines.iter())
            .filter_map(|l| match l {
                Line::Link { target, .. } => target.strip_prefix(LINK_PREFIX).map(str::to_string),
                _ => None,
            })
            .collect()
    }

    fn push_task(&mut self, section: &str, state: TaskState, text: &str) -> Result<()> {
        let text = single_line(text)?;
        let section = self.section_mut(section)?;
        insert_item(
            &mut section.lines,
            Line::Task {
                state,
                text: text.to_string(),
            },
        );
        Ok(())
    }

    fn file_index_start(&self) -> Option<usize> {
        self.sections
            .iter()
            .position(|s| s.level == 2 && s.title.eq_ignore_ascii_case(FILE_INDEX))
    }

    fn file_index_sections_mut(&mut self) -> impl Iterator<Item = &mut Section> {
        let start = self.file_index_start().unwrap_or(self.sections.len());
        self.sections[start..]
            .iter_mut()
            .enumerate()
            .take_while(|(i, s)| *i == 0 || s.level > 2)
            .map(|(_, s)| s)
    }

    /// Position of the `###` heading for `category`, created if missing.
    fn index_subsection(&mut self, category: Category) -> Result<usize> {
        let start = self
            .file_index_start()
            .ok_or_else(|| Error::NotFound(format!("section '{}' in main document", FILE_INDEX)))?;
        let heading = category.index_heading();
        let mut end = start + 1;
        while end < self.sections.len() && self.sections[end].level > 2 {
            if self.sections[end].title.eq_ignore_ascii_case(heading) {
                return Ok(end);
            }
            end += 1;
        }
        self.sections.insert(end, Section::new(3, heading));
        Ok(end)
    }
}

/// Goals, tasks, and plans are one list item each.
fn single_line(text: &str) -> Result<&str> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::Validation("item text must not be empty".to_string()));
    }
    if text.contains('\n') {
        return Err(Error::Validation(
            "item text must be a single line".to_string(),
        ));
    }
    Ok(text)
}

fn note_lines(content: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut open_fence: Option<&'static str> = None;
    for raw in content.lines() {
        let line = raw.trim_end();
        if is_fence(line) {
            open_fence = match open_fence {
                Some(_) => None,
                None if line.trim_start().starts_with("~~~") => Some("~~~"),
                None => Some("```"),
            };
            lines.push(Line::Text(line.to_string()));
        } else if open_fence.is_some() {
            lines.push(Line::Text(line.to_string()));
        } else if line == "---" || section_heading(line).is_some() {
            lines.push(Line::Text(format!("\\{}", line)));
        } else {
            lines.push(Line::parse(line));
        }
    }
    if let Some(marker) = open_fence {
        lines.push(Line::Text(marker.to_string()));
    }
    lines
}

fn completed(text: &str, today: NaiveDate) -> String {
    format!("{} (completed {})", text, today.format("%Y-%m-%d"))
}

fn find_open(lines: &[Line], text: &str) -> Option<usize> {
    lines.iter().position(|l| {
        matches!(l, Line::Task { state: TaskState::Open, text: t } if t.trim() == text)
    })
}

/// Append a list item after the last non-blank line of a section.
fn insert_item(lines: &mut Vec<Line>, item: Line) {
    let at = lines
        .iter()
        .rposition(|l| !l.is_blank())
        .map(|i| i + 1)
        .unwrap_or(0);
    lines.insert(at, item);
}

fn section_heading(line: &str) -> Option<(usize, &str)> {
    let (level, rest) = if let Some(rest) = line.strip_prefix("### ") {
        (3, rest)
    } else if let Some(rest) = line.strip_prefix("## ") {
        (2, rest)
    } else {
        return None;
    };
    let title = rest.trim();
    (!title.is_empty()).then_some((level, title))
}

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

fn trim_blank(lines: &mut Vec<Line>) {
    while lines.last().is_some_and(Line::is_blank) {
        lines.pop();
    }
    let leading = lines.iter().take_while(|l| l.is_blank()).count();
    lines.drain(..leading);
}

fn join_lines(lines: &[Line]) -> String {
    lines
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

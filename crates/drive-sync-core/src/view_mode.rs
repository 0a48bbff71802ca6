use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ViewMode {
    #[default]
    Edit,
    Document,
    Table,
    Kanban,
    Calendar,
    HtmlView,
    Docx,
    Instance,
}

impl ViewMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewMode::Edit => "edit",
            ViewMode::Document => "document",
            ViewMode::Table => "table",
            ViewMode::Kanban => "kanban",
            ViewMode::Calendar => "calendar",
            ViewMode::HtmlView => "html-view",
            ViewMode::Docx => "docx",
            ViewMode::Instance => "instance",
        }
    }
}

impl fmt::Display for ViewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewMode {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "edit" => Ok(ViewMode::Edit),
            "document" => Ok(ViewMode::Document),
            "table" => Ok(ViewMode::Table),
            "kanban" | "board" => Ok(ViewMode::Kanban),
            "calendar" => Ok(ViewMode::Calendar),
            "html-view" | "html_view" => Ok(ViewMode::HtmlView),
            "docx" => Ok(ViewMode::Docx),
            "instance" => Ok(ViewMode::Instance),
            other => Err(format!("Unknown view mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Matcher {
    Kind(&'static str),
    Extension(&'static [&'static str]),
    Category(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rule {
    matcher: Matcher,
    mode: ViewMode,
}

const fn rule(matcher: Matcher, mode: ViewMode) -> Rule {
    Rule { matcher, mode }
}

/// Evaluated top to bottom; the first hit wins and `Edit` covers the rest.
const RULES: &[Rule] = &[
    rule(Matcher::Kind("instance"), ViewMode::Instance),
    rule(Matcher::Extension(&["doc", "docx"]), ViewMode::Docx),
    rule(Matcher::Extension(&["csv", "tsv"]), ViewMode::Table),
    rule(Matcher::Extension(&["md", "markdown"]), ViewMode::Document),
    rule(Matcher::Extension(&["html", "htm"]), ViewMode::HtmlView),
    rule(Matcher::Category("spreadsheet"), ViewMode::Table),
    rule(Matcher::Category("view"), ViewMode::HtmlView),
];

fn extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Initial view mode for a freshly selected file.
pub fn default_view_mode(file_name: &str, file_type: Option<&str>) -> ViewMode {
    let ext = extension(file_name);
    let file_type = file_type.map(str::trim).filter(|t| !t.is_empty());
    for rule in RULES {
        let hit = match rule.matcher {
            Matcher::Kind(kind) | Matcher::Category(kind) => file_type == Some(kind),
            Matcher::Extension(exts) => ext.as_deref().is_some_and(|e| exts.contains(&e)),
        };
        if hit {
            return rule.mode;
        }
    }
    ViewMode::Edit
}

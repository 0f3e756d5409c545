use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::core::classifier::Classification;

pub const UNKNOWN_GROUP: &str = "Unknown";
pub const UNTAGGED_GROUP: &str = "Untagged";
/// Destination used when the reference image is itself a placeholder.
pub const PLACEHOLDER_GROUP: &str = "no_image";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupingMode {
    Category,
    Subcategory,
    Tag,
}

impl fmt::Display for GroupingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupingMode::Category => "category",
            GroupingMode::Subcategory => "subcategory",
            GroupingMode::Tag => "tag",
        };
        f.write_str(name)
    }
}

impl FromStr for GroupingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "category" => Ok(GroupingMode::Category),
            "subcategory" => Ok(GroupingMode::Subcategory),
            "tag" | "tags" => Ok(GroupingMode::Tag),
            other => Err(format!("unknown grouping mode: {}", other)),
        }
    }
}

fn is_disallowed(c: char) -> bool {
    matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control()
}

/// Make `name` safe as a single folder segment.
///
/// Path-unsafe and control characters become `_`, surrounding whitespace is
/// trimmed, and a name left with nothing but `_`/`.` becomes `Unknown`.
pub fn sanitize(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if is_disallowed(c) { '_' } else { c })
        .collect();
    let trimmed = replaced.trim();

    if trimmed.chars().all(|c| c == '_' || c == '.') {
        UNKNOWN_GROUP.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Folder (relative, may contain one `/` in subcategory mode) for a classification.
pub fn group_for(classification: &Classification, mode: GroupingMode) -> String {
    match mode {
        GroupingMode::Category => sanitize(&classification.category),
        GroupingMode::Subcategory => format!(
            "{}/{}",
            sanitize(&classification.category),
            sanitize(&classification.subcategory)
        ),
        GroupingMode::Tag => classification
            .tags
            .first()
            .map(|tag| sanitize(tag))
            .unwrap_or_else(|| UNTAGGED_GROUP.to_string()),
    }
}

/// Destination folder name for reference-based grouping, e.g. `nature_forest`.
pub fn reference_group(classification: &Classification, reference_is_placeholder: bool) -> String {
    if reference_is_placeholder {
        return PLACEHOLDER_GROUP.to_string();
    }
    sanitize(&format!(
        "{}_{}",
        classification.category.trim().to_lowercase(),
        classification.subcategory.trim().to_lowercase()
    ))
}

/// Normalise a folder scope to a key prefix: `""` for the root, otherwise
/// without a leading `/` and with exactly one trailing `/`.
pub fn scope_prefix(folder: &str) -> String {
    let trimmed = folder.trim().trim_start_matches('/').trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Join a scope and a relative folder into a destination prefix ending in `/`.
pub fn destination_prefix(base: &str, group: &str) -> String {
    format!("{}{}/", scope_prefix(base), group.trim_matches('/'))
}

//! Display titles for synced files.
//!
//! A title is taken from YAML frontmatter (`title:`), then the first level-one
//! heading, then the file stem.

use std::collections::HashMap;

/// Split leading `---` frontmatter from the body.
///
/// Returns `None` for the frontmatter when it is absent, empty or not valid
/// YAML.
fn split_frontmatter(content: &str) -> (Option<HashMap<String, serde_yaml::Value>>, &str) {
    let Some(rest) = content.strip_prefix("---") else {
        return (None, content);
    };

    match rest.find("\n---") {
        Some(pos) => {
            let yaml = rest[..pos].trim();
            let body = rest[pos + 4..].trim_start_matches('\n');
            let frontmatter = match serde_yaml::from_str::<HashMap<String, serde_yaml::Value>>(yaml) {
                Ok(fm) if !fm.is_empty() => Some(fm),
                _ => None,
            };
            (frontmatter, body)
        }
        None => (None, content),
    }
}

/// File name without directories or the last extension.
pub fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(pos) => &name[..pos],
    }
}

/// Title for a file given its path and bytes. Non-UTF-8 content falls back to
/// the stem.
pub fn extract_title(path: &str, content: &[u8]) -> String {
    let Ok(text) = std::str::from_utf8(content) else {
        return file_stem(path).to_string();
    };

    let (frontmatter, body) = split_frontmatter(text);

    if let Some(title) = frontmatter
        .as_ref()
        .and_then(|fm| fm.get("title"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return title.to_string();
    }

    if let Some(heading) = body
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(str::trim)
        .filter(|h| !h.is_empty())
    {
        return heading.to_string();
    }

    file_stem(path).to_string()
}

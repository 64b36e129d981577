//! Task ID generation and branch naming
//!
//! Task IDs use the format `{kind}-{8-hex}` where the hex is taken from the
//! random tail of a v7 UUID, e.g. `task-3fa91c0e` or `fix-0b7d22aa`.

use tracing::debug;

/// Maximum length of the slug portion of a branch name
const MAX_SLUG_LEN: usize = 40;

/// Generate an ID with the given kind prefix
pub fn generate_id(kind: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    // The leading hex digits of a v7 UUID are the timestamp; take the random tail
    let tail = &uuid[uuid.len() - 8..];
    format!("{}-{}", kind, tail)
}

/// Generate a fresh task ID
pub fn generate_task_id() -> String {
    generate_id("task")
}

/// Slugify free text for use in branch names
pub fn slugify(text: &str) -> String {
    let slug = text
        .to_lowercase()
        .chars()
        // Strip apostrophes entirely, replace other non-alphanumeric with hyphens
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    if slug.len() <= MAX_SLUG_LEN {
        return slug;
    }

    // Cut at a word boundary where possible
    let cut = &slug[..MAX_SLUG_LEN];
    match cut.rfind('-') {
        Some(idx) if idx > 0 => cut[..idx].to_string(),
        _ => cut.to_string(),
    }
}

/// Derive a git branch name from the task ID and description
///
/// `worker/` + `task-3fa91c0e` + `add-login-form` -> `worker/task-3fa91c0e-add-login-form`
pub fn branch_name(prefix: &str, id: &str, description: &str) -> String {
    let slug = slugify(description);
    let branch = if slug.is_empty() {
        format!("{}{}", prefix, id)
    } else {
        format!("{}{}-{}", prefix, id, slug)
    };
    debug!(%branch, "branch_name: derived");
    branch
}

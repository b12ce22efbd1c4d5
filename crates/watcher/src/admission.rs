use std::path::Path;

/// Decides from the file name alone whether a dropped file is worth
/// ingesting. No filesystem access.
///
/// Staging suffixes (`.tmp`, `.part`) and names carrying a leading or
/// trailing `~` (editor backups, Office owner files) are rejected; everything
/// else must end in `.txt`. All comparisons are case-insensitive.
pub fn admissible_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    if lower.ends_with(".tmp") || lower.ends_with(".part") {
        return false;
    }
    if lower.ends_with('~') || lower.starts_with('~') {
        return false;
    }
    lower.ends_with(".txt")
}

/// [`admissible_name`] applied to the final path component. Paths without a
/// file name are never admissible.
pub fn admissible_path(path: &Path) -> bool {
    match path.file_name() {
        Some(name) => admissible_name(&name.to_string_lossy()),
        None => false,
    }
}

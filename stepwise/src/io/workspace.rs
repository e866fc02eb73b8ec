//! Environment context for repair prompts: a bounded sample of workspace files.

use std::path::Path;

use walkdir::{DirEntry, WalkDir};

/// Directories never worth listing in a prompt.
const SKIPPED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    "__pycache__",
    ".venv",
    "venv",
    ".stepwise",
];

/// Up to `cap` relative file paths under `root`, sorted, skipping vendored and build dirs.
pub fn sample_files(root: &Path, cap: usize) -> Vec<String> {
    if cap == 0 {
        return Vec::new();
    }
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry));
    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative.to_string_lossy().replace('\\', "/"));
        }
        if files.len() >= cap {
            break;
        }
    }
    files
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

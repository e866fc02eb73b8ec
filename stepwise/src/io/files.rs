//! Filesystem operations for file and directory steps.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::debug;

use crate::core::types::{PlanStep, StepKind};

/// Result of a successful file operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    /// One-line description for the execution log.
    pub message: String,
    /// Content produced by `read_file` / `list_dir`.
    pub output: Option<String>,
}

impl OperationResult {
    fn message(message: String) -> Self {
        Self {
            message,
            output: None,
        }
    }
}

/// Applies file and directory steps. `run_command` is not handled here.
pub trait FileOperations {
    fn apply(&self, step: &PlanStep) -> Result<OperationResult>;
}

/// File operations rooted at a working directory.
#[derive(Debug, Clone)]
pub struct LocalFiles {
    root: PathBuf,
}

impl LocalFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a step path against the root.
    ///
    /// Absolute paths inside the root are made relative first. `.` and `..`
    /// are folded lexically; paths that would leave the root are rejected.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf> {
        let raw_path = Path::new(raw.trim());
        let relative = if raw_path.is_absolute() {
            raw_path
                .strip_prefix(&self.root)
                .map_err(|_| anyhow!("path outside working directory: {raw}"))?
                .to_path_buf()
        } else {
            raw_path.to_path_buf()
        };

        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        bail!("path outside working directory: {raw}");
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    bail!("path outside working directory: {raw}")
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Ok(self.root.clone());
        }
        Ok(self.root.join(normalized))
    }

    /// Resolve a path that a destructive operation will remove or move.
    fn resolve_below_root(&self, raw: &str) -> Result<PathBuf> {
        let target = self.resolve(raw)?;
        if target == self.root {
            bail!("refusing to modify the working directory itself: {raw}");
        }
        Ok(target)
    }
}

impl FileOperations for LocalFiles {
    fn apply(&self, step: &PlanStep) -> Result<OperationResult> {
        debug!(action = %step.kind.action(), "applying file operation");
        match &step.kind {
            StepKind::CreateFile { path, content } => {
                let target = self.resolve(path)?;
                if target.exists() {
                    bail!("EEXIST: file already exists: {path}");
                }
                write_with_parents(&target, content)?;
                Ok(OperationResult::message(format!("Created {path}")))
            }
            StepKind::UpdateFile { path, content } => {
                let target = self.resolve(path)?;
                write_with_parents(&target, content)?;
                Ok(OperationResult::message(format!("Updated {path}")))
            }
            StepKind::PatchFile {
                path,
                old_content,
                new_content,
            } => {
                let target = self.resolve(path)?;
                let current = fs::read_to_string(&target)
                    .with_context(|| format!("read {}", target.display()))?;
                if !current.contains(old_content.as_str()) {
                    bail!("patch target not found in {path}: old content does not match");
                }
                let patched = current.replacen(old_content.as_str(), new_content, 1);
                fs::write(&target, patched)
                    .with_context(|| format!("write {}", target.display()))?;
                Ok(OperationResult::message(format!("Patched {path}")))
            }
            StepKind::DeleteFile { path } => {
                let target = self.resolve_below_root(path)?;
                fs::remove_file(&target).with_context(|| format!("delete {}", target.display()))?;
                Ok(OperationResult::message(format!("Deleted {path}")))
            }
            StepKind::ReadFile { path } => {
                let target = self.resolve(path)?;
                let contents = fs::read_to_string(&target)
                    .with_context(|| format!("read {}", target.display()))?;
                Ok(OperationResult {
                    message: format!("Read {path} ({} bytes)", contents.len()),
                    output: Some(contents),
                })
            }
            StepKind::CreateDir { path } => {
                let target = self.resolve(path)?;
                fs::create_dir_all(&target)
                    .with_context(|| format!("create directory {}", target.display()))?;
                Ok(OperationResult::message(format!("Created directory {path}")))
            }
            StepKind::DeleteDir { path } => {
                let target = self.resolve_below_root(path)?;
                fs::remove_dir_all(&target)
                    .with_context(|| format!("delete directory {}", target.display()))?;
                Ok(OperationResult::message(format!("Deleted directory {path}")))
            }
            StepKind::ListDir { path } => {
                let target = self.resolve(path)?;
                let listing = list_dir(&target)?;
                Ok(OperationResult {
                    message: format!("Listed {path} ({} entries)", listing.len()),
                    output: Some(listing.join("\n")),
                })
            }
            StepKind::RenameDir { from, to } => {
                let source = self.resolve_below_root(from)?;
                let destination = self.resolve_below_root(to)?;
                if destination.exists() {
                    bail!("EEXIST: destination already exists: {to}");
                }
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory {}", parent.display()))?;
                }
                fs::rename(&source, &destination).with_context(|| {
                    format!("rename {} to {}", source.display(), destination.display())
                })?;
                Ok(OperationResult::message(format!("Renamed {from} to {to}")))
            }
            StepKind::RunCommand { .. } => {
                Err(anyhow!("run_command is not a file operation"))
            }
        }
    }
}

fn write_with_parents(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

/// Sorted entry names; directories get a trailing `/`.
fn list_dir(path: &Path) -> Result<Vec<String>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path).with_context(|| format!("list {}", path.display()))? {
        let entry = entry.with_context(|| format!("list {}", path.display()))?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().map(|ty| ty.is_dir()).unwrap_or(false) {
            name.push('/');
        }
        entries.push(name);
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(kind: StepKind) -> PlanStep {
        PlanStep {
            kind,
            summary: None,
        }
    }

    #[test]
    fn create_then_patch_then_read() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = LocalFiles::new(temp.path());

        files
            .apply(&step(StepKind::CreateFile {
                path: "src/a.txt".to_string(),
                content: "hello world".to_string(),
            }))
            .expect("create");
        files
            .apply(&step(StepKind::PatchFile {
                path: "src/a.txt".to_string(),
                old_content: "world".to_string(),
                new_content: "there".to_string(),
            }))
            .expect("patch");
        let read = files
            .apply(&step(StepKind::ReadFile {
                path: "src/a.txt".to_string(),
            }))
            .expect("read");
        assert_eq!(read.output.as_deref(), Some("hello there"));
    }

    #[test]
    fn create_existing_file_is_eexist() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "x").expect("write");
        let err = LocalFiles::new(temp.path())
            .apply(&step(StepKind::CreateFile {
                path: "a.txt".to_string(),
                content: "y".to_string(),
            }))
            .unwrap_err();
        assert!(err.to_string().starts_with("EEXIST"));
    }

    #[test]
    fn patch_mismatch_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "abc").expect("write");
        let err = LocalFiles::new(temp.path())
            .apply(&step(StepKind::PatchFile {
                path: "a.txt".to_string(),
                old_content: "zzz".to_string(),
                new_content: "y".to_string(),
            }))
            .unwrap_err();
        assert!(err.to_string().contains("old content does not match"));
    }

    #[test]
    fn rename_and_list_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = LocalFiles::new(temp.path());
        fs::create_dir_all(temp.path().join("old/inner")).expect("mkdir");
        fs::write(temp.path().join("old/file.txt"), "x").expect("write");

        files
            .apply(&step(StepKind::RenameDir {
                from: "old".to_string(),
                to: "new".to_string(),
            }))
            .expect("rename");
        let listing = files
            .apply(&step(StepKind::ListDir {
                path: "new".to_string(),
            }))
            .expect("list");
        assert_eq!(listing.output.as_deref(), Some("file.txt\ninner/"));
        assert!(!temp.path().join("old").exists());
    }

    #[test]
    fn resolve_rejects_escapes_and_strips_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = LocalFiles::new(temp.path());

        assert!(files.resolve("../outside.txt").is_err());
        assert!(files.resolve("a/../../outside.txt").is_err());
        assert!(files.resolve("/definitely/elsewhere").is_err());

        let absolute = temp.path().join("inside.txt");
        let resolved = files
            .resolve(absolute.to_str().expect("utf8 path"))
            .expect("resolve");
        assert_eq!(resolved, absolute);
        assert_eq!(
            files.resolve("a/./b/../c").expect("resolve"),
            temp.path().join("a/c")
        );
        assert_eq!(files.resolve("a/..").expect("resolve"), temp.path());
    }

    #[test]
    fn delete_dir_refuses_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = LocalFiles::new(temp.path())
            .apply(&step(StepKind::DeleteDir {
                path: ".".to_string(),
            }))
            .unwrap_err();
        assert!(err.to_string().contains("refusing"));
    }

    #[test]
    fn dotted_paths_to_the_root_are_never_removed() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("a")).expect("mkdir");
        fs::create_dir_all(temp.path().join("x")).expect("mkdir");
        fs::write(temp.path().join("keep.txt"), "keep").expect("write");
        let files = LocalFiles::new(temp.path());

        for path in ["a/..", "./x/..", "a/../x/.."] {
            let err = files
                .apply(&step(StepKind::DeleteDir {
                    path: path.to_string(),
                }))
                .unwrap_err();
            assert!(err.to_string().contains("refusing"), "{path}: {err}");
        }
        let err = files
            .apply(&step(StepKind::RenameDir {
                from: "a/..".to_string(),
                to: "elsewhere".to_string(),
            }))
            .unwrap_err();
        assert!(err.to_string().contains("refusing"), "{err}");
        assert!(files
            .apply(&step(StepKind::DeleteFile {
                path: "x/..".to_string(),
            }))
            .is_err());

        assert!(temp.path().join("keep.txt").exists());
        assert!(temp.path().join("a").is_dir());
        assert!(temp.path().join("x").is_dir());
    }

    #[test]
    fn dotted_paths_below_the_root_resolve_to_the_real_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("a/b")).expect("mkdir");
        fs::write(temp.path().join("keep.txt"), "keep").expect("write");
        LocalFiles::new(temp.path())
            .apply(&step(StepKind::DeleteDir {
                path: "a/b/..".to_string(),
            }))
            .expect("delete");
        assert!(!temp.path().join("a").exists());
        assert!(temp.path().join("keep.txt").exists());
    }
}

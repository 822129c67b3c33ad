//! Path guard and write budgets.
//!
//! Runs before anything else touches a database path: `..` segments are
//! rejected before resolution, symlinks are resolved, and the result must
//! sit under the configured root (when one is set). The guard also owns
//! the write-size ceilings: a per-call byte cap, a sliding per-minute
//! aggregate budget, and the import batch cap. Logs only ever see the
//! root-relative form of the path.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("path contains a parent-directory segment: {0}")]
    TraversalRejected(String),
    #[error("path {path} resolves outside the server root {root}")]
    OutsideRoot { path: String, root: String },
    #[error("cannot resolve path {path}: {source}")]
    Unresolvable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write of {size} bytes exceeds the per-call cap of {cap} bytes")]
    WriteTooLarge { size: usize, cap: usize },
    #[error("per-minute write budget of {budget} bytes exhausted")]
    WriteBudgetExhausted { budget: usize },
    #[error("import batch of {size} items exceeds the cap of {cap}")]
    ImportBatchTooLarge { size: usize, cap: usize },
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Containment root; `None` disables the containment check.
    pub root: Option<PathBuf>,
    /// Per-call write size cap.
    pub max_write_bytes: usize,
    /// Aggregate write bytes allowed per minute.
    pub write_budget_per_minute: usize,
    /// Maximum items in one import call.
    pub import_batch_cap: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_write_bytes: 64 * 1024,
            write_budget_per_minute: 512 * 1024,
            import_batch_cap: 500,
        }
    }
}

#[derive(Debug)]
pub struct PathGuard {
    config: GuardConfig,
    /// Root-relative (or bare-name) display form for logs and audit.
    db_display: String,
    /// (instant, bytes) entries inside the sliding minute window.
    window: VecDeque<(Instant, usize)>,
}

impl PathGuard {
    /// Validate `db_path` and build the guard. The database file itself may
    /// not exist yet; its parent directory must resolve.
    pub fn validate(db_path: &Path, config: GuardConfig) -> Result<Self, GuardError> {
        // `..` is rejected on the raw path, before any resolution.
        for component in db_path.components() {
            if matches!(component, Component::ParentDir) {
                return Err(GuardError::TraversalRejected(
                    db_path.to_string_lossy().into_owned(),
                ));
            }
        }

        let resolved = resolve_with_missing_leaf(db_path).map_err(|source| {
            GuardError::Unresolvable {
                path: db_path.to_string_lossy().into_owned(),
                source,
            }
        })?;

        let db_display = match &config.root {
            Some(root) => {
                let root = root
                    .canonicalize()
                    .map_err(|source| GuardError::Unresolvable {
                        path: root.to_string_lossy().into_owned(),
                        source,
                    })?;
                let relative = resolved.strip_prefix(&root).map_err(|_| {
                    GuardError::OutsideRoot {
                        path: resolved.to_string_lossy().into_owned(),
                        root: root.to_string_lossy().into_owned(),
                    }
                })?;
                relative.to_string_lossy().into_owned()
            }
            None => db_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "memory.db".to_string()),
        };

        Ok(Self {
            config,
            db_display,
            window: VecDeque::new(),
        })
    }

    /// Root-relative path for logs. Never the absolute form.
    pub fn db_display(&self) -> &str {
        &self.db_display
    }

    pub fn import_batch_cap(&self) -> usize {
        self.config.import_batch_cap
    }

    /// Per-call size cap plus the per-minute aggregate budget; charging is
    /// atomic — a rejected write consumes nothing.
    pub fn charge_write(&mut self, bytes: usize) -> Result<(), GuardError> {
        self.charge_write_at(bytes, Instant::now())
    }

    pub(crate) fn charge_write_at(&mut self, bytes: usize, now: Instant) -> Result<(), GuardError> {
        if bytes > self.config.max_write_bytes {
            return Err(GuardError::WriteTooLarge {
                size: bytes,
                cap: self.config.max_write_bytes,
            });
        }
        let minute = Duration::from_secs(60);
        while let Some((at, _)) = self.window.front() {
            if now.duration_since(*at) > minute {
                self.window.pop_front();
            } else {
                break;
            }
        }
        let used: usize = self.window.iter().map(|(_, b)| b).sum();
        if used + bytes > self.config.write_budget_per_minute {
            return Err(GuardError::WriteBudgetExhausted {
                budget: self.config.write_budget_per_minute,
            });
        }
        self.window.push_back((now, bytes));
        Ok(())
    }

    pub fn check_import_batch(&self, size: usize) -> Result<(), GuardError> {
        if size > self.config.import_batch_cap {
            return Err(GuardError::ImportBatchTooLarge {
                size,
                cap: self.config.import_batch_cap,
            });
        }
        Ok(())
    }
}

/// Canonicalize a path whose final component may not exist yet.
fn resolve_with_missing_leaf(path: &Path) -> std::io::Result<PathBuf> {
    match path.canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(_) => {
            let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path.file_name().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
            })?;
            let parent = match parent {
                Some(parent) => parent.canonicalize()?,
                None => std::env::current_dir()?,
            };
            Ok(parent.join(file_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_dir_segments_are_rejected_before_resolution() {
        let err = PathGuard::validate(
            Path::new("/tmp/../etc/passwd.db"),
            GuardConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GuardError::TraversalRejected(_)));
    }

    #[test]
    fn paths_outside_the_root_are_rejected() {
        let root = tempfile::tempdir().expect("root");
        let elsewhere = tempfile::tempdir().expect("elsewhere");
        let config = GuardConfig {
            root: Some(root.path().to_path_buf()),
            ..Default::default()
        };
        let err =
            PathGuard::validate(&elsewhere.path().join("memory.db"), config).unwrap_err();
        assert!(matches!(err, GuardError::OutsideRoot { .. }));
    }

    #[test]
    fn contained_path_displays_root_relative() {
        let root = tempfile::tempdir().expect("root");
        std::fs::create_dir_all(root.path().join("proj")).expect("mkdir");
        let config = GuardConfig {
            root: Some(root.path().to_path_buf()),
            ..Default::default()
        };
        let guard =
            PathGuard::validate(&root.path().join("proj/memory.db"), config).expect("guard");
        assert_eq!(guard.db_display(), "proj/memory.db");
        assert!(!guard.db_display().contains(root.path().to_str().unwrap()));
    }

    #[test]
    fn symlink_escape_is_caught_after_resolution() {
        let root = tempfile::tempdir().expect("root");
        let outside = tempfile::tempdir().expect("outside");
        let link = root.path().join("escape");
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path(), &link).expect("symlink");
            let config = GuardConfig {
                root: Some(root.path().to_path_buf()),
                ..Default::default()
            };
            let err = PathGuard::validate(&link.join("memory.db"), config).unwrap_err();
            assert!(matches!(err, GuardError::OutsideRoot { .. }), "got {err:?}");
        }
    }

    #[test]
    fn per_call_write_cap_is_enforced() {
        let mut guard =
            PathGuard::validate(Path::new("memory.db"), GuardConfig::default()).expect("guard");
        assert!(guard.charge_write(64 * 1024).is_ok());
        let err = guard.charge_write(64 * 1024 + 1).unwrap_err();
        assert!(matches!(err, GuardError::WriteTooLarge { .. }));
    }

    #[test]
    fn minute_budget_accumulates_and_recovers() {
        let config = GuardConfig {
            max_write_bytes: 1000,
            write_budget_per_minute: 1500,
            ..Default::default()
        };
        let mut guard = PathGuard::validate(Path::new("memory.db"), config).expect("guard");
        let t0 = Instant::now();
        assert!(guard.charge_write_at(1000, t0).is_ok());
        let err = guard.charge_write_at(1000, t0).unwrap_err();
        assert!(matches!(err, GuardError::WriteBudgetExhausted { .. }));
        // Past the window the budget refills.
        let later = t0 + Duration::from_secs(61);
        assert!(guard.charge_write_at(1000, later).is_ok());
    }

    #[test]
    fn import_batch_cap_is_enforced() {
        let guard =
            PathGuard::validate(Path::new("memory.db"), GuardConfig::default()).expect("guard");
        assert!(guard.check_import_batch(500).is_ok());
        assert!(matches!(
            guard.check_import_batch(501),
            Err(GuardError::ImportBatchTooLarge { .. })
        ));
    }
}

//! Per-environment filesystem root.
//!
//! ```text
//!   <root>/            0700
//!     cache/ logs/ data/ tmp/
//!     .env             SAFE_ENV_* variables, extended by later steps
//!     vm/              created by the VM controller
//! ```

use std::collections::BTreeMap;
use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use nix::sys::statvfs::statvfs;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const SUBDIRS: [&str; 4] = ["cache", "logs", "data", "tmp"];
pub const ENV_FILE: &str = ".env";
pub const ROOT_PREFIX: &str = "safe_env_";

/// Free space below which the health check complains.
pub const MIN_FREE_BYTES: u64 = 1024 * 1024 * 1024;
pub const LOG_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const TMP_MAX_AGE: Duration = Duration::from_secs(60 * 60);

const SECURE_MODE: u32 = 0o700;

/// Outcome of [`EnvLayout::collect_garbage`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub logs_removed: usize,
    pub tmp_removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvLayout {
    root: PathBuf,
}

impl EnvLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<parent>/safe_env_<YYYYmmdd_HHMMSS>_<short>`.
    pub fn generated(parent: &Path, short: &str) -> Self {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        Self::new(parent.join(format!("{ROOT_PREFIX}{stamp}_{short}")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subdir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(ENV_FILE)
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Create the skeleton and the environment file.
    ///
    /// Fails if the root already exists so that an unwind never removes a
    /// directory this call did not create.
    pub fn create(&self) -> Result<()> {
        if self.root.exists() {
            return Err(Error::InvalidSpec(format!(
                "environment root {} already exists",
                self.root.display()
            )));
        }
        if let Some(parent) = self.root.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::fs(parent, e))?;
        }

        let mut builder = DirBuilder::new();
        builder.mode(SECURE_MODE);
        builder.create(&self.root).map_err(|e| Error::fs(&self.root, e))?;
        // From here on the root is ours; a failure must not leave it behind.
        if let Err(e) = self.fill(&builder) {
            if let Err(cleanup) = std::fs::remove_dir_all(&self.root) {
                warn!(root = %self.root.display(), error = %cleanup, "Could not remove partial root");
            }
            return Err(e);
        }
        info!(root = %self.root.display(), "Environment root created");
        Ok(())
    }

    fn fill(&self, builder: &DirBuilder) -> Result<()> {
        // The umask may have narrowed the mode further; pin it.
        set_mode(&self.root, SECURE_MODE)?;

        for name in SUBDIRS {
            let dir = self.subdir(name);
            builder.create(&dir).map_err(|e| Error::fs(&dir, e))?;
            set_mode(&dir, SECURE_MODE)?;
        }

        let vars = self.base_vars();
        self.append_env(&vars)
    }

    fn base_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![("SAFE_ENV_ROOT".to_string(), self.root.display().to_string())];
        for name in SUBDIRS {
            vars.push((
                format!("SAFE_ENV_{}", name.to_ascii_uppercase()),
                self.subdir(name).display().to_string(),
            ));
        }
        vars.push((
            "SAFE_ENV_CREATED_AT".to_string(),
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        ));
        vars
    }

    /// Append `KEY=value` lines to `.env`.
    pub fn append_env(&self, vars: &[(String, String)]) -> Result<()> {
        let path = self.env_file();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| Error::fs(&path, e))?;
        let body: String = vars.iter().map(|(k, v)| format!("{k}={v}\n")).collect();
        file.write_all(body.as_bytes()).map_err(|e| Error::fs(&path, e))
    }

    /// Parse `.env`. Later assignments win; blank lines and `#` comments are skipped.
    pub fn read_env(&self) -> Result<BTreeMap<String, String>> {
        let path = self.env_file();
        let raw = std::fs::read_to_string(&path).map_err(|e| Error::fs(&path, e))?;
        Ok(parse_env(&raw))
    }

    /// Delete the root. Returns `false` if it was already gone.
    pub fn remove(&self) -> Result<bool> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {
                info!(root = %self.root.display(), "Environment root removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::fs(&self.root, e)),
        }
    }

    /// Problems with the root, empty when healthy.
    pub fn check_health(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let meta = match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => meta,
            _ => {
                issues.push(format!("environment root {} does not exist", self.root.display()));
                return issues;
            }
        };

        let mode = meta.permissions().mode() & 0o777;
        if mode != SECURE_MODE {
            issues.push(format!("root permissions are {mode:o}, expected 700"));
        }

        let probe = self.root.join(".write-probe");
        match std::fs::write(&probe, b"") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
            }
            Err(_) => issues.push("root is not writable".to_string()),
        }

        match free_bytes(&self.root) {
            Ok(free) if free < MIN_FREE_BYTES => issues.push(format!(
                "less than 1 GiB free ({} MiB)",
                free / (1024 * 1024)
            )),
            Ok(_) => {}
            Err(e) => issues.push(format!("cannot read free space: {e}")),
        }

        for name in SUBDIRS {
            if !self.subdir(name).is_dir() {
                issues.push(format!("subdirectory `{name}` is missing"));
            }
        }
        issues
    }

    /// Drop logs older than a day and temp files older than an hour.
    pub fn collect_garbage(&self) -> GcReport {
        let now = SystemTime::now();
        let report = GcReport {
            logs_removed: remove_older_than(&self.subdir("logs"), LOG_MAX_AGE, now),
            tmp_removed: remove_older_than(&self.subdir("tmp"), TMP_MAX_AGE, now),
        };
        debug!(root = %self.root.display(), ?report, "Garbage collected");
        report
    }

    /// Empty `cache/` and `tmp/`, keeping the directories.
    pub fn clean_cache(&self) -> Result<()> {
        for name in ["cache", "tmp"] {
            let dir = self.subdir(name);
            let listing = match std::fs::read_dir(&dir) {
                Ok(listing) => listing,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::fs(&dir, e)),
            };
            for entry in listing {
                let path = entry.map_err(|e| Error::fs(&dir, e))?.path();
                let removed = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                removed.map_err(|e| Error::fs(&path, e))?;
            }
        }
        Ok(())
    }

    /// Environment roots directly under `parent`: directories holding a `.env`.
    pub fn scan(parent: &Path) -> Vec<EnvLayout> {
        let Ok(listing) = std::fs::read_dir(parent) else {
            return Vec::new();
        };
        let mut found: Vec<EnvLayout> = listing
            .filter_map(|entry| entry.ok())
            .map(|entry| EnvLayout::new(entry.path()))
            .filter(|layout| layout.exists() && layout.env_file().is_file())
            .collect();
        found.sort_by(|a, b| a.root.cmp(&b.root));
        found
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| Error::fs(path, e))
}

fn free_bytes(path: &Path) -> nix::Result<u64> {
    let stat = statvfs(path)?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

fn parse_env(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .collect()
}

fn remove_older_than(dir: &Path, max_age: Duration, now: SystemTime) -> usize {
    let Ok(listing) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in listing.filter_map(|e| e.ok()) {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age <= max_age {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to remove old file"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, FileTimes};

    fn age(path: &Path, secs: u64) {
        let when = SystemTime::now() - Duration::from_secs(secs);
        let file = File::options().write(true).open(path).unwrap();
        file.set_times(FileTimes::new().set_accessed(when).set_modified(when))
            .unwrap();
    }

    #[test]
    fn test_create_skeleton() {
        let dir = tempfile::tempdir().unwrap();
        let layout = EnvLayout::new(dir.path().join("env"));
        layout.create().unwrap();

        for name in SUBDIRS {
            let meta = std::fs::metadata(layout.subdir(name)).unwrap();
            assert!(meta.is_dir());
            assert_eq!(meta.permissions().mode() & 0o777, 0o700);
        }
        let vars = layout.read_env().unwrap();
        assert_eq!(vars["SAFE_ENV_ROOT"], layout.root().display().to_string());
        assert_eq!(vars["SAFE_ENV_TMP"], layout.subdir("tmp").display().to_string());
        assert!(vars.contains_key("SAFE_ENV_CREATED_AT"));
    }

    #[test]
    fn test_create_refuses_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let layout = EnvLayout::new(dir.path());
        assert!(matches!(layout.create(), Err(Error::InvalidSpec(_))));
        assert!(dir.path().exists());
    }

    /// A path of exactly `len` bytes under `base`, built from components
    /// short enough for every filesystem.
    fn path_of_len(base: &Path, len: usize) -> PathBuf {
        let mut path = base.to_path_buf();
        while path.as_os_str().len() + 1 + 200 + 10 < len {
            path.push("d".repeat(200));
        }
        let rest = len - path.as_os_str().len() - 1;
        path.push("r".repeat(rest));
        path
    }

    #[test]
    fn test_failed_create_removes_partial_root() {
        let dir = tempfile::tempdir().unwrap();
        // The root itself fits in PATH_MAX; `<root>/cache` does not.
        let root = path_of_len(dir.path(), 4092);
        let layout = EnvLayout::new(&root);

        let err = layout.create().unwrap_err();
        assert!(matches!(err, Error::Filesystem { .. }), "{err}");
        assert!(!root.exists());
        assert!(root.parent().unwrap().exists());
    }

    #[test]
    fn test_generated_name() {
        let layout = EnvLayout::generated(Path::new("/srv/envs"), "abcd1234");
        let name = layout.root().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("safe_env_"));
        assert!(name.ends_with("_abcd1234"));
        assert_eq!(name.len(), "safe_env_".len() + 15 + 1 + 8);
    }

    #[test]
    fn test_append_env() {
        let dir = tempfile::tempdir().unwrap();
        let layout = EnvLayout::new(dir.path().join("env"));
        layout.create().unwrap();
        layout
            .append_env(&[("NETWORK_ENABLED".into(), "true".into())])
            .unwrap();
        assert_eq!(layout.read_env().unwrap()["NETWORK_ENABLED"], "true");
    }

    #[test]
    fn test_parse_env_skips_comments() {
        let vars = parse_env("# header\nA=1\n\nB=x=y\nA=2\n");
        assert_eq!(vars["A"], "2");
        assert_eq!(vars["B"], "x=y");
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = EnvLayout::new(dir.path().join("env"));
        layout.create().unwrap();
        assert!(layout.remove().unwrap());
        assert!(!layout.remove().unwrap());
    }

    // ── maintenance ───────────────────────────────────────────────────

    #[test]
    fn test_health_reports_problems() {
        let dir = tempfile::tempdir().unwrap();
        let layout = EnvLayout::new(dir.path().join("env"));
        assert_eq!(layout.check_health().len(), 1);

        layout.create().unwrap();
        std::fs::remove_dir(layout.subdir("data")).unwrap();
        set_mode(layout.root(), 0o755).unwrap();
        let issues = layout.check_health();
        assert!(issues.iter().any(|i| i.contains("`data`")));
        assert!(issues.iter().any(|i| i.contains("755")));
    }

    #[test]
    fn test_garbage_collection_ages() {
        let dir = tempfile::tempdir().unwrap();
        let layout = EnvLayout::new(dir.path().join("env"));
        layout.create().unwrap();

        let old_log = layout.subdir("logs").join("old.log");
        let new_log = layout.subdir("logs").join("new.log");
        let old_tmp = layout.subdir("tmp").join("scratch");
        for p in [&old_log, &new_log, &old_tmp] {
            std::fs::write(p, b"x").unwrap();
        }
        age(&old_log, 2 * 24 * 3600);
        age(&old_tmp, 2 * 3600);

        let report = layout.collect_garbage();
        assert_eq!(report, GcReport { logs_removed: 1, tmp_removed: 1 });
        assert!(!old_log.exists());
        assert!(new_log.exists());
        assert!(!old_tmp.exists());
    }

    #[test]
    fn test_clean_cache_keeps_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = EnvLayout::new(dir.path().join("env"));
        layout.create().unwrap();
        std::fs::create_dir(layout.subdir("cache").join("pkg")).unwrap();
        std::fs::write(layout.subdir("cache").join("pkg/blob"), b"x").unwrap();
        std::fs::write(layout.subdir("tmp").join("t"), b"x").unwrap();

        layout.clean_cache().unwrap();
        assert!(layout.subdir("cache").is_dir());
        assert_eq!(std::fs::read_dir(layout.subdir("cache")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(layout.subdir("tmp")).unwrap().count(), 0);
    }

    #[test]
    fn test_scan_finds_roots() {
        let dir = tempfile::tempdir().unwrap();
        EnvLayout::new(dir.path().join("a")).create().unwrap();
        EnvLayout::new(dir.path().join("b")).create().unwrap();
        std::fs::create_dir(dir.path().join("not-an-env")).unwrap();

        let found = EnvLayout::scan(dir.path());
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].root(), dir.path().join("a"));
        assert!(EnvLayout::scan(&dir.path().join("absent")).is_empty());
    }
}

//! Filesystem probe: a local directory tree.
//!
//! | level | name      | inspects                                                    |
//! |-------|-----------|-------------------------------------------------------------|
//! | 1     | access    | existence, readability, writability, listability            |
//! | 2     | structure | directory/file counts, depth, symlinks, skipped directories |
//! | 3     | metadata  | per-file size, mode, mtime, type, git status, SHA-256       |
//!
//! Symlinks are never followed. Ignored paths (built-in list, `.gitignore`,
//! `.fs-agent-ignore`, config) are never entered. Files matching the
//! never-read or never-hash lists are listed but not fingerprinted by content;
//! never-read files are typed by name only.
//!
//! Git status comes from one `git status --porcelain -z` per level-3 run.
//! Files outside a work tree report `no_git`; tracked, unchanged files `clean`.

use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fs::{self, File, Metadata};
use std::io::{ErrorKind, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use crate::core::config::FilesystemConfig;
use crate::core::external::{self, ExternalCapability};
use crate::core::matcher::{self, PathRules};
use crate::core::model::{Facts, LadderResult, ProbeOutcome, Target, TargetKind};
use crate::core::probe::{Probe, ProbeError};
use crate::core::snapshot::{self, EntityRecord};

pub const PRIVACY_SKIPPED: &str = "skipped:privacy";
pub const SIZE_SKIPPED: &str = "skipped:size";
pub const GIT_CLEAN: &str = "clean";
pub const NO_GIT: &str = "no_git";
const TOP_N: usize = 10;
const SNIFF_BYTES: usize = 512;

pub struct FilesystemProbe {
    config: FilesystemConfig,
    timeout: Duration,
}

impl FilesystemProbe {
    pub fn new(config: FilesystemConfig) -> Self {
        Self {
            config,
            timeout: Duration::from_secs(5),
        }
    }

    /// Bound for the `git` commands run at level 3.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn git(&self, root: &Path, args: &[&str]) -> Option<String> {
        match external::execute(ExternalCapability::VcsRead, "git", args, root, self.timeout) {
            Ok(out) if out.success() => Some(out.stdout),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "git unavailable for status");
                None
            }
        }
    }

    /// Changed paths under `root`, keyed relative to `root`. `None` when
    /// `root` is not inside a git work tree or git cannot run.
    fn git_status(&self, root: &Path) -> Option<BTreeMap<String, String>> {
        let toplevel = self.git(root, &["rev-parse", "--show-toplevel"])?;
        let toplevel = fs::canonicalize(toplevel.trim()).ok()?;
        let canonical = fs::canonicalize(root).ok()?;
        let prefix = canonical
            .strip_prefix(&toplevel)
            .ok()?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let raw = self.git(
            root,
            &["status", "--porcelain", "-z", "--untracked-files=all", "--", "."],
        )?;
        Some(parse_porcelain_z(&raw, &prefix))
    }

    fn root(&self, target: &Target) -> PathBuf {
        PathBuf::from(&target.locator)
    }

    fn access(&self, root: &Path) -> Result<ProbeOutcome, ProbeError> {
        let meta = fs::metadata(root).map_err(|e| io_to_probe(root, e))?;
        if !meta.is_dir() {
            return Err(ProbeError::Connectivity(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        let entries = fs::read_dir(root).map_err(|e| io_to_probe(root, e))?;
        let top_level_entries = entries.count();
        let writable = !meta.permissions().readonly();
        let canonical = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

        let mut facts = Facts::new();
        facts.insert("path".into(), json!(canonical.display().to_string()));
        facts.insert("readable".into(), json!(true));
        facts.insert("writable".into(), json!(writable));
        facts.insert("can_list_contents".into(), json!(true));
        facts.insert(
            "permission_level".into(),
            json!(if writable { "read_write" } else { "read" }),
        );
        facts.insert("top_level_entries".into(), json!(top_level_entries));
        facts.insert("case_sensitive".into(), json!(case_sensitive(root)));
        Ok(ProbeOutcome::success(facts))
    }

    fn structure(&self, root: &Path) -> Result<ProbeOutcome, ProbeError> {
        fs::read_dir(root).map_err(|e| io_to_probe(root, e))?;
        let ignore = matcher::ignore_rules_for(root, &self.config.ignore);
        let mut walk = Walk::new(root, &ignore, &self.config);
        let mut files = 0usize;
        let mut size = 0u64;
        let _ = walk.visit(root, 0, &mut |_, _, meta| {
            files += 1;
            size += meta.len();
            ControlFlow::Continue(())
        });

        let mut facts = Facts::new();
        facts.insert("total_files".into(), json!(files));
        facts.insert("total_directories".into(), json!(walk.dirs));
        facts.insert("total_size_bytes".into(), json!(size));
        facts.insert("max_depth_reached".into(), json!(walk.max_depth_reached));
        facts.insert("directories_skipped".into(), json!(walk.skipped));
        facts.insert("symlinks_found".into(), json!(walk.symlinks));
        Ok(ProbeOutcome::with_warnings(facts, walk.warnings))
    }

    fn metadata(&self, root: &Path) -> Result<ProbeOutcome, ProbeError> {
        fs::read_dir(root).map_err(|e| io_to_probe(root, e))?;
        let ignore = matcher::ignore_rules_for(root, &self.config.ignore);
        let never_read = matcher::never_read_rules(&self.config.never_read);
        let never_hash = matcher::never_hash_rules(&self.config.never_hash);
        let max_files = self.config.max_files;
        let max_hash_bytes = self.config.max_hash_bytes;
        let git = self.git_status(root);
        let mut git_changed = 0usize;

        let mut walk = Walk::new(root, &ignore, &self.config);
        let mut files = Map::new();
        let mut file_types: BTreeMap<String, u64> = BTreeMap::new();
        let mut ranked: Vec<(String, u64, u64)> = Vec::new();
        let mut total_size = 0u64;
        let mut hashed = 0usize;
        let mut privacy_skipped = 0usize;
        let mut file_warnings = Vec::new();
        let mut truncated = false;

        let _ = walk.visit(root, 0, &mut |path, rel, meta| {
            if files.len() >= max_files {
                truncated = true;
                return ControlFlow::Break(());
            }
            let size = meta.len();
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            *file_types.entry(extension.clone()).or_insert(0) += 1;

            let sealed = never_read.matches(rel);
            let file_type = detect_file_type(path, !sealed);
            let git_status = match &git {
                Some(changes) => match changes.get(rel) {
                    Some(code) => {
                        git_changed += 1;
                        code.clone()
                    }
                    None => GIT_CLEAN.to_string(),
                },
                None => NO_GIT.to_string(),
            };

            let hash = if sealed || never_hash.matches(rel) {
                privacy_skipped += 1;
                PRIVACY_SKIPPED.to_string()
            } else if size >= max_hash_bytes {
                SIZE_SKIPPED.to_string()
            } else {
                match hash_file(path) {
                    Ok(h) => {
                        hashed += 1;
                        h
                    }
                    Err(e) => {
                        file_warnings.push(format!("cannot hash {}: {}", rel, e));
                        format!("error:{}", e.kind())
                    }
                }
            };

            let mut info = Map::new();
            info.insert("size_bytes".into(), json!(size));
            info.insert("modified".into(), json!(crate::core::time::epoch_z(modified)));
            info.insert("extension".into(), json!(extension));
            info.insert("mode".into(), json!(mode_string(meta)));
            info.insert("type".into(), json!(file_type));
            info.insert("git_status".into(), json!(git_status));
            info.insert("hash".into(), json!(hash));
            files.insert(rel.to_string(), Value::Object(info));

            total_size += size;
            ranked.push((rel.to_string(), size, modified));
            ControlFlow::Continue(())
        });

        let mut warnings = walk.warnings;
        warnings.extend(file_warnings);
        if truncated {
            warnings.push(format!("limited to analyzing first {} files", max_files));
        }

        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let largest: Vec<&str> = ranked.iter().take(TOP_N).map(|r| r.0.as_str()).collect();
        let largest = json!(largest);
        ranked.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
        let newest: Vec<&str> = ranked.iter().take(TOP_N).map(|r| r.0.as_str()).collect();

        let mut facts = Facts::new();
        facts.insert("files_analyzed".into(), json!(files.len()));
        facts.insert("files_hashed".into(), json!(hashed));
        facts.insert("privacy_skipped".into(), json!(privacy_skipped));
        facts.insert("total_size_bytes".into(), json!(total_size));
        facts.insert("file_types".into(), json!(file_types));
        facts.insert("git_repository".into(), json!(git.is_some()));
        facts.insert("git_changed_files".into(), json!(git_changed));
        facts.insert("largest_files".into(), largest);
        facts.insert("newest_files".into(), json!(newest));
        facts.insert("files".into(), Value::Object(files));
        Ok(ProbeOutcome::with_warnings(facts, warnings))
    }
}

impl Probe for FilesystemProbe {
    fn kind(&self) -> TargetKind {
        TargetKind::Filesystem
    }

    fn max_level(&self) -> u8 {
        3
    }

    fn level_name(&self, level: u8) -> &'static str {
        match level {
            1 => "access",
            2 => "structure",
            3 => "metadata",
            _ => "unknown",
        }
    }

    fn invoke(
        &self,
        target: &Target,
        level: u8,
        _so_far: &LadderResult,
    ) -> Result<ProbeOutcome, ProbeError> {
        let root = self.root(target);
        match level {
            1 => self.access(&root),
            2 => self.structure(&root),
            3 => self.metadata(&root),
            other => Err(ProbeError::Malformed(format!(
                "filesystem probe has no level {}",
                other
            ))),
        }
    }

    /// One entity per file from level 3. Files without a content hash are
    /// fingerprinted over their size and modification time instead.
    fn entities(&self, result: &LadderResult) -> BTreeMap<String, EntityRecord> {
        let Some(files) = result
            .facts(3)
            .and_then(|f| f.get("files"))
            .and_then(Value::as_object)
        else {
            return BTreeMap::new();
        };
        files
            .iter()
            .map(|(rel, info)| {
                let size = info.get("size_bytes").and_then(Value::as_u64).unwrap_or(0);
                let hash = info.get("hash").and_then(Value::as_str).unwrap_or("");
                let fingerprint = if is_content_hash(hash) {
                    hash.to_string()
                } else {
                    snapshot::fingerprint_value(&json!({
                        "size_bytes": size,
                        "modified": info.get("modified"),
                    }))
                };
                let mut record = EntityRecord::new(fingerprint, size);
                if let Some(modified) = info.get("modified") {
                    record.metadata.insert("modified".into(), modified.clone());
                }
                (rel.clone(), record)
            })
            .collect()
    }
}

fn is_content_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

fn io_to_probe(path: &Path, e: std::io::Error) -> ProbeError {
    match e.kind() {
        ErrorKind::PermissionDenied => {
            ProbeError::Permission(format!("{}: {}", path.display(), e))
        }
        ErrorKind::NotFound => {
            ProbeError::Connectivity(format!("{} does not exist", path.display()))
        }
        _ => ProbeError::Connectivity(format!("{}: {}", path.display(), e)),
    }
}

/// MIME type from the file name, else sniffed from the first bytes when the
/// file may be read: a NUL byte means binary.
fn detect_file_type(path: &Path, may_read: bool) -> String {
    if let Some(mime) = mime_guess::from_path(path).first_raw() {
        return mime.to_string();
    }
    if !may_read {
        return "unknown".to_string();
    }
    let mut head = [0u8; SNIFF_BYTES];
    match File::open(path).and_then(|mut f| f.read(&mut head)) {
        Ok(n) if head[..n].contains(&0) => "application/octet-stream".to_string(),
        Ok(_) => "text/plain".to_string(),
        Err(_) => "unknown".to_string(),
    }
}

/// Parse `git status --porcelain -z`. Paths arrive relative to the work-tree
/// top; only those under `prefix` are kept, re-keyed relative to it.
fn parse_porcelain_z(raw: &str, prefix: &str) -> BTreeMap<String, String> {
    let mut changes = BTreeMap::new();
    let mut fields = raw.split('\0');
    while let Some(entry) = fields.next() {
        let (Some(code), Some(path)) = (entry.get(..2), entry.get(3..)) else {
            continue;
        };
        // Renames and copies carry the original path as an extra field.
        if code.contains('R') || code.contains('C') {
            fields.next();
        }
        let rel = if prefix.is_empty() {
            Some(path)
        } else {
            path.strip_prefix(prefix).and_then(|p| p.strip_prefix('/'))
        };
        if let Some(rel) = rel {
            changes.insert(rel.to_string(), code.trim().to_string());
        }
    }
    changes
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    use sha2::{Digest, Sha256};
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(unix)]
fn mode_string(meta: &Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:o}", meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn mode_string(meta: &Metadata) -> String {
    if meta.permissions().readonly() { "r" } else { "rw" }.to_string()
}

/// The root resolves when looked up with its final component's case swapped.
fn case_sensitive(root: &Path) -> bool {
    let Ok(canonical) = fs::canonicalize(root) else {
        return true;
    };
    let Some(name) = canonical.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return true;
    };
    let swapped: String = name
        .chars()
        .map(|c| {
            if c.is_lowercase() {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect();
    if swapped == name {
        return true;
    }
    !canonical.with_file_name(swapped).exists()
}

/// Depth-first, sorted, symlink-free traversal with per-directory caps.
struct Walk<'a> {
    root: &'a Path,
    ignore: &'a PathRules,
    max_depth: usize,
    max_entries_per_dir: usize,
    warnings: Vec<String>,
    dirs: usize,
    skipped: usize,
    symlinks: usize,
    max_depth_reached: usize,
}

type FileVisitor<'v> = dyn FnMut(&Path, &str, &Metadata) -> ControlFlow<()> + 'v;

impl<'a> Walk<'a> {
    fn new(root: &'a Path, ignore: &'a PathRules, config: &FilesystemConfig) -> Self {
        Self {
            root,
            ignore,
            max_depth: config.max_depth,
            max_entries_per_dir: config.max_entries_per_dir,
            warnings: Vec::new(),
            dirs: 0,
            skipped: 0,
            symlinks: 0,
            max_depth_reached: 0,
        }
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn visit(&mut self, dir: &Path, depth: usize, on_file: &mut FileVisitor<'_>) -> ControlFlow<()> {
        self.max_depth_reached = self.max_depth_reached.max(depth);
        let read = match fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) => {
                self.warnings
                    .push(format!("cannot list {}: {}", self.relative(dir), e));
                return ControlFlow::Continue(());
            }
        };
        let mut entries: Vec<_> = read.filter_map(Result::ok).collect();
        entries.sort_by_key(|e| e.file_name());
        if entries.len() > self.max_entries_per_dir {
            self.warnings.push(format!(
                "directory {} has {} entries, limited to {}",
                self.relative(dir),
                entries.len(),
                self.max_entries_per_dir
            ));
            entries.truncate(self.max_entries_per_dir);
        }

        for entry in entries {
            let path = entry.path();
            let rel = self.relative(&path);
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    self.warnings.push(format!("cannot stat {}: {}", rel, e));
                    continue;
                }
            };
            if meta.file_type().is_symlink() {
                self.symlinks += 1;
                continue;
            }
            if self.ignore.matches(&rel) {
                if meta.is_dir() {
                    self.skipped += 1;
                }
                continue;
            }
            if meta.is_dir() {
                self.dirs += 1;
                if depth + 1 > self.max_depth {
                    self.skipped += 1;
                    self.warnings
                        .push(format!("depth limit {} reached at {}", self.max_depth, rel));
                    continue;
                }
                self.visit(&path, depth + 1, on_file)?;
            } else if meta.is_file() {
                on_file(&path, &rel, &meta)?;
            }
        }
        ControlFlow::Continue(())
    }
}

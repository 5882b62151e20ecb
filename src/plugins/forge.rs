//! Forge probe: a local git checkout and its hosted repository, via `git` and `gh`.
//!
//! Level 1 only needs the CLI. Every deeper level needs an authenticated
//! session; without one the probe answers `Permission`, which stops the
//! ladder without recording the level.

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::external::{self, CommandOutput, ExternalCapability};
use crate::core::model::{Facts, LadderResult, ProbeOutcome, Target, TargetKind};
use crate::core::probe::{Probe, ProbeError};
use crate::core::snapshot::EntityRecord;

const PR_FIELDS: &str = "number,title,state,author,createdAt,updatedAt,headRefName";
const MERGED_PR_FIELDS: &str = "number,title,state,mergedAt,author";
const ISSUE_FIELDS: &str = "number,title,state,author,assignees,labels,createdAt,updatedAt";
const CLOSED_ISSUE_FIELDS: &str = "number,title,state,closedAt,author";
const RUN_FIELDS: &str = "databaseId,name,status,conclusion,createdAt,headBranch";

pub struct ForgeProbe {
    timeout: Duration,
}

impl ForgeProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn git(&self, cwd: &Path, args: &[&str]) -> Result<CommandOutput, ProbeError> {
        external::execute(ExternalCapability::VcsRead, "git", args, cwd, self.timeout)
    }

    fn gh(&self, cwd: &Path, args: &[&str]) -> Result<CommandOutput, ProbeError> {
        external::execute(ExternalCapability::ForgeRead, "gh", args, cwd, self.timeout)
    }

    /// Run a `gh` command that prints JSON and parse it.
    fn gh_json(&self, cwd: &Path, args: &[&str]) -> Result<Value, ProbeError> {
        let out = self.gh(cwd, args)?;
        if !out.success() {
            return Err(classify_gh_failure(&out));
        }
        Ok(serde_json::from_str(out.stdout.trim())?)
    }

    fn require_auth(&self, so_far: &LadderResult) -> Result<(), ProbeError> {
        let authenticated = so_far
            .facts(1)
            .and_then(|f| f.get("authenticated"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if authenticated {
            Ok(())
        } else {
            Err(ProbeError::Permission(
                "gh is not authenticated; run `gh auth login`".to_string(),
            ))
        }
    }

    fn cli_access(&self, cwd: &Path) -> Result<ProbeOutcome, ProbeError> {
        let version = self.gh(cwd, &["--version"])?;
        if !version.success() {
            return Err(ProbeError::Connectivity(format!(
                "gh --version exited with {:?}",
                version.exit_code
            )));
        }
        let mut facts = Facts::new();
        let mut warnings = Vec::new();
        facts.insert("gh_installed".into(), json!(true));
        facts.insert("gh_version".into(), json!(version.first_line()));

        let auth = self.gh(cwd, &["auth", "status"])?;
        let authenticated = auth.success();
        facts.insert("authenticated".into(), json!(authenticated));
        // gh prints its status report on stderr in recent releases.
        let report = format!("{}\n{}", auth.stdout, auth.stderr);
        facts.insert("token_scopes".into(), json!(token_scopes(&report)));

        if authenticated {
            match self.gh_json(cwd, &["api", "rate_limit", "--jq", ".rate"]) {
                Ok(rate) => {
                    facts.insert("rate_limit".into(), rate);
                }
                Err(e) => warnings.push(format!("rate limit unavailable: {}", e)),
            }
        } else {
            warnings.push("gh is installed but not authenticated".to_string());
        }
        Ok(ProbeOutcome::with_warnings(facts, warnings))
    }

    fn repository(&self, cwd: &Path) -> Result<ProbeOutcome, ProbeError> {
        let inside = self.git(cwd, &["rev-parse", "--is-inside-work-tree"])?;
        if !inside.success() || inside.first_line() != "true" {
            return Err(ProbeError::Connectivity(format!(
                "{} is not inside a git work tree",
                cwd.display()
            )));
        }
        let mut facts = Facts::new();
        let mut warnings = Vec::new();
        facts.insert("is_git_repo".into(), json!(true));

        let remote = self.git(cwd, &["remote", "get-url", "origin"])?;
        let remote_url = remote.success().then(|| remote.first_line());
        facts.insert("has_remote".into(), json!(remote_url.is_some()));
        facts.insert("remote_url".into(), json!(remote_url));

        let head = self.git(cwd, &["symbolic-ref", "refs/remotes/origin/HEAD"])?;
        if head.success() {
            let line = head.first_line();
            let branch = line.rsplit('/').next().unwrap_or_default().to_string();
            facts.insert("default_branch".into(), json!(branch));
        } else {
            warnings.push("default branch unknown (origin/HEAD not set)".to_string());
        }

        match remote_url.as_deref().and_then(parse_owner_repo) {
            Some((owner, name)) => {
                facts.insert("repo_owner".into(), json!(owner));
                facts.insert("repo_name".into(), json!(name));
                let slug = format!("{}/{}", owner, name);
                match self.gh_json(
                    cwd,
                    &["repo", "view", &slug, "--json", "visibility,isFork,parent,nameWithOwner"],
                ) {
                    Ok(view) => {
                        facts.insert("repo_visibility".into(), view["visibility"].clone());
                        facts.insert(
                            "is_fork".into(),
                            json!(view["isFork"].as_bool().unwrap_or(false)),
                        );
                        facts.insert(
                            "parent_repo".into(),
                            view["parent"]["nameWithOwner"].clone(),
                        );
                    }
                    Err(ProbeError::Permission(msg)) => return Err(ProbeError::Permission(msg)),
                    Err(e) => warnings.push(format!("repository view failed: {}", e)),
                }
            }
            None if remote_url.is_some() => {
                warnings.push("origin is not a recognizable forge remote".to_string());
            }
            None => warnings.push("no origin remote configured".to_string()),
        }
        Ok(ProbeOutcome::with_warnings(facts, warnings))
    }

    fn pull_requests(&self, cwd: &Path) -> Result<ProbeOutcome, ProbeError> {
        let mut facts = Facts::new();
        let mut warnings = Vec::new();
        let branch = self.git(cwd, &["branch", "--show-current"])?;
        let current = branch.first_line();
        if current.is_empty() {
            warnings.push("detached HEAD; no current branch".to_string());
        }
        facts.insert("current_branch".into(), json!(current));

        let open = self.gh_json(cwd, &["pr", "list", "--limit", "10", "--json", PR_FIELDS])?;
        let merged = self.gh_json(
            cwd,
            &["pr", "list", "--state", "merged", "--limit", "5", "--json", MERGED_PR_FIELDS],
        )?;
        let current_pr = open.as_array().and_then(|prs| {
            prs.iter()
                .find(|pr| !current.is_empty() && pr["headRefName"] == current.as_str())
                .map(|pr| pr["number"].clone())
        });
        facts.insert("open_pr_count".into(), json!(array_len(&open)));
        facts.insert("current_branch_pr".into(), json!(current_pr));
        facts.insert("open_prs".into(), open);
        facts.insert("recent_merged_prs".into(), merged);
        Ok(ProbeOutcome::with_warnings(facts, warnings))
    }

    fn issues(&self, cwd: &Path) -> Result<ProbeOutcome, ProbeError> {
        let open = self.gh_json(cwd, &["issue", "list", "--limit", "20", "--json", ISSUE_FIELDS])?;
        let closed = self.gh_json(
            cwd,
            &["issue", "list", "--state", "closed", "--limit", "10", "--json", CLOSED_ISSUE_FIELDS],
        )?;
        let mut warnings = Vec::new();
        let labels = match self.gh_json(
            cwd,
            &["label", "list", "--limit", "50", "--json", "name,description,color"],
        ) {
            Ok(labels) => labels,
            Err(e) => {
                warnings.push(format!("labels unavailable: {}", e));
                json!([])
            }
        };
        let assigned = match self.gh(cwd, &["api", "user", "--jq", ".login"]) {
            Ok(out) if out.success() => assigned_to(&open, &out.first_line()),
            _ => {
                warnings.push("current user unknown; assigned issues not computed".to_string());
                Vec::new()
            }
        };

        let mut facts = Facts::new();
        facts.insert("open_issues_count".into(), json!(array_len(&open)));
        facts.insert("assigned_issues".into(), json!(assigned));
        facts.insert("open_issues".into(), open);
        facts.insert("recent_closed_issues".into(), closed);
        facts.insert("labels".into(), labels);
        Ok(ProbeOutcome::with_warnings(facts, warnings))
    }

    fn workflows(&self, cwd: &Path) -> Result<ProbeOutcome, ProbeError> {
        let runs = self.gh_json(cwd, &["run", "list", "--limit", "10", "--json", RUN_FIELDS])?;
        let workflows = self.gh_json(cwd, &["workflow", "list", "--all", "--json", "name,state,id"])?;
        let active: Vec<Value> = runs
            .as_array()
            .map(|runs| {
                runs.iter()
                    .filter(|r| matches!(r["status"].as_str(), Some("in_progress" | "queued")))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut facts = Facts::new();
        facts.insert("workflow_files".into(), json!(workflow_files(cwd)));
        facts.insert("active_runs".into(), json!(active));
        facts.insert("recent_runs".into(), runs);
        facts.insert("workflows".into(), workflows);
        Ok(ProbeOutcome::success(facts))
    }
}

impl Probe for ForgeProbe {
    fn kind(&self) -> TargetKind {
        TargetKind::Forge
    }

    fn max_level(&self) -> u8 {
        5
    }

    fn level_name(&self, level: u8) -> &'static str {
        match level {
            1 => "cli_access",
            2 => "repository",
            3 => "pull_requests",
            4 => "issues",
            5 => "workflows",
            _ => "unknown",
        }
    }

    fn invoke(
        &self,
        target: &Target,
        level: u8,
        so_far: &LadderResult,
    ) -> Result<ProbeOutcome, ProbeError> {
        let cwd = PathBuf::from(&target.locator);
        if !cwd.is_dir() {
            return Err(ProbeError::Connectivity(format!(
                "{} is not a directory",
                cwd.display()
            )));
        }
        if level > 1 {
            self.require_auth(so_far)?;
        }
        match level {
            1 => self.cli_access(&cwd),
            2 => self.repository(&cwd),
            3 => self.pull_requests(&cwd),
            4 => self.issues(&cwd),
            5 => self.workflows(&cwd),
            other => Err(ProbeError::Malformed(format!("forge probe has no level {}", other))),
        }
    }

    fn entities(&self, result: &LadderResult) -> BTreeMap<String, EntityRecord> {
        let mut entities = BTreeMap::new();
        let sources = [
            (3u8, "open_prs", "pr", "number"),
            (3, "recent_merged_prs", "pr", "number"),
            (4, "open_issues", "issue", "number"),
            (4, "recent_closed_issues", "issue", "number"),
            (5, "workflows", "workflow", "id"),
        ];
        for (level, field, prefix, id_field) in sources {
            let Some(items) = result
                .facts(level)
                .and_then(|f| f.get(field))
                .and_then(Value::as_array)
            else {
                continue;
            };
            for item in items {
                let id = match &item[id_field] {
                    Value::Number(n) => n.to_string(),
                    Value::String(s) => s.clone(),
                    _ => continue,
                };
                let mut record = EntityRecord::from_fields(item);
                if let Some(state) = item["state"].as_str() {
                    record.metadata.insert("state".into(), json!(state));
                }
                entities.insert(format!("{}/{}", prefix, id), record);
            }
        }
        entities
    }
}

/// A failed `gh` call: auth and access problems are permission failures,
/// everything else is treated as the forge being unreachable.
fn classify_gh_failure(out: &CommandOutput) -> ProbeError {
    let stderr = out.stderr.trim();
    let lower = stderr.to_lowercase();
    let denied = ["auth login", "not logged", "http 401", "http 403", "permission", "forbidden"];
    if denied.iter().any(|needle| lower.contains(needle)) {
        ProbeError::Permission(stderr.lines().next().unwrap_or("access denied").to_string())
    } else {
        ProbeError::Connectivity(format!(
            "gh exited with {:?}: {}",
            out.exit_code,
            stderr.lines().next().unwrap_or("")
        ))
    }
}

fn token_scopes(report: &str) -> Vec<String> {
    report
        .lines()
        .find_map(|line| line.split_once("Token scopes:").map(|(_, rest)| rest))
        .map(|rest| {
            rest.split(',')
                .map(|s| s.trim().trim_matches('\'').trim_matches('"').to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// `(owner, name)` from an https or ssh remote URL.
fn parse_owner_repo(url: &str) -> Option<(String, String)> {
    let trimmed = url.trim().trim_end_matches('/');
    let path = if let Some((_, rest)) = trimmed.split_once("://") {
        rest.split_once('/')?.1
    } else {
        trimmed.split_once(':')?.1
    };
    let mut parts = path.rsplitn(2, '/');
    let name = parts.next()?.trim_end_matches(".git");
    let owner = parts.next()?.rsplit('/').next()?;
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some((owner.to_string(), name.to_string()))
}

fn array_len(value: &Value) -> usize {
    value.as_array().map(Vec::len).unwrap_or(0)
}

fn assigned_to(issues: &Value, login: &str) -> Vec<Value> {
    issues
        .as_array()
        .map(|issues| {
            issues
                .iter()
                .filter(|issue| {
                    issue["assignees"]
                        .as_array()
                        .is_some_and(|a| a.iter().any(|u| u["login"] == login))
                })
                .map(|issue| issue["number"].clone())
                .collect()
        })
        .unwrap_or_default()
}

fn workflow_files(repo: &Path) -> Vec<String> {
    let dir = repo.join(".github").join("workflows");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.ends_with(".yml") || n.ends_with(".yaml"))
        .collect();
    names.sort();
    names
}

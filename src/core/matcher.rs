//! Glob rule lists for filesystem discovery: what to skip, what never to
//! read, what never to fingerprint.
//!
//! Rules are checked in order against an entry's file name and against its
//! path relative to the discovery root, case-insensitively. The first match
//! wins and is reported back so callers can say which rule fired.

use glob::{MatchOptions, Pattern};
use std::fs;
use std::path::Path;

/// Ignore-list files read from the discovery root.
pub const IGNORE_FILES: [&str; 2] = [".gitignore", ".fs-agent-ignore"];

pub const DEFAULT_IGNORE: &[&str] = &[
    "node_modules",
    ".git",
    "__pycache__",
    ".cache",
    "venv",
    ".venv",
    ".groundtruth",
    "target",
];

pub const DEFAULT_NEVER_READ: &[&str] = &[
    "*.env*",
    ".env*",
    "*.key",
    "*.pem",
    "*_rsa",
    "*_ecdsa",
    "*_dsa",
    "id_rsa*",
    "id_dsa*",
    "id_ecdsa*",
    "id_ed25519*",
    "credentials*",
    "secrets*",
    "*secret*",
    "*token*",
    "*password*",
    "*passwd*",
    "*.keystore",
    "*.p12",
    "*.pfx",
    "*.cert",
    "*.crt",
    "*.kdbx",
    "*.1password",
    "*.keychain",
    "*.jks",
    "*.truststore",
    "*.bks",
    "*.asc",
    "*.gpg",
    "*.pgp",
];

pub const DEFAULT_NEVER_HASH: &[&str] = &[
    "*.sqlite",
    "*.sqlite3",
    "*.db",
    "*.keychain",
    "*.keystore",
    "*.kdbx",
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub matched: bool,
    /// Source text of the rule that matched.
    pub rule: Option<String>,
}

impl RuleMatch {
    fn miss() -> Self {
        Self {
            matched: false,
            rule: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathRules {
    rules: Vec<(String, Pattern)>,
}

impl PathRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pattern strings; invalid globs are skipped with a warning.
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Self::new();
        for p in patterns {
            rules.push(p.as_ref());
        }
        rules
    }

    pub fn push(&mut self, raw: &str) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }
        match Pattern::new(raw) {
            Ok(pattern) => self.rules.push((raw.to_string(), pattern)),
            Err(e) => tracing::warn!(pattern = raw, error = %e, "invalid glob rule skipped"),
        }
    }

    pub fn extend<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for p in patterns {
            self.push(p.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Test `rel_path` (relative to the discovery root, `/`-separated).
    pub fn check(&self, rel_path: &str) -> RuleMatch {
        let rel_path = rel_path.trim_start_matches("./");
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        for (raw, pattern) in &self.rules {
            if pattern.matches_with(name, MATCH_OPTIONS)
                || pattern.matches_with(rel_path, MATCH_OPTIONS)
            {
                return RuleMatch {
                    matched: true,
                    rule: Some(raw.clone()),
                };
            }
        }
        RuleMatch::miss()
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        self.check(rel_path).matched
    }
}

/// Ignore rules in gitignore syntax: comments and negations are dropped,
/// anchoring and trailing slashes are stripped.
pub fn parse_ignore_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('!'))
        .map(|l| l.trim_start_matches('/').trim_end_matches('/').to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Built-in ignore list, the root's ignore files, then `extra`.
pub fn ignore_rules_for(root: &Path, extra: &[String]) -> PathRules {
    let mut rules = PathRules::from_patterns(DEFAULT_IGNORE);
    for file in IGNORE_FILES {
        let path = root.join(file);
        match fs::read_to_string(&path) {
            Ok(content) => rules.extend(parse_ignore_lines(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "unreadable ignore file"),
        }
    }
    rules.extend(extra);
    rules
}

pub fn never_read_rules(extra: &[String]) -> PathRules {
    let mut rules = PathRules::from_patterns(DEFAULT_NEVER_READ);
    rules.extend(extra);
    rules
}

pub fn never_hash_rules(extra: &[String]) -> PathRules {
    let mut rules = PathRules::from_patterns(DEFAULT_NEVER_HASH);
    rules.extend(extra);
    rules
}

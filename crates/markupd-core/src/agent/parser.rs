//! Output parser - commit extraction from agent output
//!
//! Matchers are tried in order and the first hit wins. The two short-hash
//! matchers are heuristics: any 7+ hex run after a "commit" keyword is taken
//! at face value, so prose like "commit deadbee" will match.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

// ========== Patterns ==========

/// Labelled token the prompt asks for: "COMMIT_HASH: <40 hex>"
static LABELLED_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bCOMMIT_HASH:\s*([0-9a-f]{40})\b").unwrap());

/// git summary line after a commit keyword: "Committed: [main 1a2b3c4] ..."
/// (also tolerates "[main (root-commit) 1a2b3c4]")
static BRACKETED_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bcommit\w*\b[^\[\n]{0,40}\[[^\]\s]+(?:\s+\([^)\n]*\))?\s+([0-9a-f]{7,40})\]")
        .unwrap()
});

/// Bare phrase: "commit 1a2b3c4"
static BARE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bcommit\s+([0-9a-f]{7,40})\b").unwrap());

/// Hosted remote: https://github.com/owner/repo(.git) or git@gitlab.com:group/repo.git
static REMOTE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:https?://|git@)(github\.com|gitlab\.com)[/:]([A-Za-z0-9_.\-]+(?:/[A-Za-z0-9_.\-]+)+)")
        .unwrap()
});

static MATCHERS: [&Lazy<Regex>; 3] = [&LABELLED_PATTERN, &BRACKETED_PATTERN, &BARE_PATTERN];

// ========== Types ==========

/// Commit details recovered from agent output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl CommitInfo {
    pub fn is_empty(&self) -> bool {
        self.hash.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Host {
    GitHub,
    GitLab,
}

impl Host {
    fn commit_url(&self, slug: &str, hash: &str) -> String {
        match self {
            Host::GitHub => format!("https://github.com/{}/commit/{}", slug, hash),
            Host::GitLab => format!("https://gitlab.com/{}/-/commit/{}", slug, hash),
        }
    }
}

// ========== Extraction ==========

/// Extract the commit hash (and a browsable URL when a remote is mentioned)
pub fn extract(output: &str) -> CommitInfo {
    let Some(hash) = find_hash(output) else {
        return CommitInfo::default();
    };

    let url = find_remote(output).map(|(host, slug)| host.commit_url(&slug, &hash));

    CommitInfo {
        hash: Some(hash),
        url,
    }
}

fn find_hash(output: &str) -> Option<String> {
    MATCHERS.iter().find_map(|pattern| {
        pattern
            .captures(output)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
    })
}

fn find_remote(output: &str) -> Option<(Host, String)> {
    REMOTE_PATTERN.captures_iter(output).find_map(|caps| {
        let host = match caps.get(1)?.as_str() {
            "github.com" => Host::GitHub,
            _ => Host::GitLab,
        };
        let slug = normalize_slug(host, caps.get(2)?.as_str())?;
        Some((host, slug))
    })
}

/// Reduce a matched path to `owner/repo` (GitLab keeps subgroups)
fn normalize_slug(host: Host, path: &str) -> Option<String> {
    // "/-/" starts GitLab's route namespace
    let mut segments: Vec<&str> = path
        .split('/')
        .take_while(|s| *s != "-")
        .filter(|s| !s.is_empty())
        .collect();

    if host == Host::GitHub {
        segments.truncate(2);
    }

    let last = segments.pop()?;
    let last = last.trim_end_matches('.');
    let last = last.strip_suffix(".git").unwrap_or(last);
    if last.is_empty() || segments.is_empty() {
        return None;
    }
    segments.push(last);
    Some(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_labelled_token() {
        let info = extract(&format!("Done.\nCOMMIT_HASH: {}\n", FULL));
        assert_eq!(info.hash.as_deref(), Some(FULL));
        assert!(info.url.is_none());
    }

    #[test]
    fn test_labelled_token_is_lowercased() {
        let upper = FULL.to_uppercase();
        let info = extract(&format!("COMMIT_HASH: {}", upper));
        assert_eq!(info.hash.as_deref(), Some(FULL));
    }

    #[test]
    fn test_labelled_wins_over_earlier_short_hash() {
        let out = format!("Committed: [main 1a2b3c4] tweak\n...\nCOMMIT_HASH: {}\n", FULL);
        assert_eq!(extract(&out).hash.as_deref(), Some(FULL));
    }

    #[test]
    fn test_bracketed_short_hash() {
        let info = extract("I committed the change: [main 1a2b3c4] Make button green");
        assert_eq!(info.hash.as_deref(), Some("1a2b3c4"));
    }

    #[test]
    fn test_bracketed_root_commit() {
        let info = extract("Commit created: [master (root-commit) 9f8e7d6] init");
        assert_eq!(info.hash.as_deref(), Some("9f8e7d6"));
    }

    #[test]
    fn test_bracketed_wins_over_bare() {
        let info = extract("commit abcdef0 was reverted. Committed [dev 1234567] redo");
        assert_eq!(info.hash.as_deref(), Some("1234567"));
    }

    #[test]
    fn test_bare_phrase() {
        let info = extract("Created commit 7c4a1e9b in the repo");
        assert_eq!(info.hash.as_deref(), Some("7c4a1e9b"));
    }

    #[test]
    fn test_too_short_or_no_keyword() {
        assert!(extract("commit abc12").is_empty());
        assert!(extract("[main 1a2b3c4] no keyword before").is_empty());
        assert!(extract(&format!("hash {}", FULL)).is_empty());
        assert!(extract("").is_empty());
    }

    #[test]
    fn test_github_https_url() {
        let out = format!(
            "Pushed to https://github.com/acme/shop.git\nCOMMIT_HASH: {}",
            FULL
        );
        let info = extract(&out);
        assert_eq!(
            info.url.as_deref(),
            Some(format!("https://github.com/acme/shop/commit/{}", FULL).as_str())
        );
    }

    #[test]
    fn test_github_ssh_url() {
        let info = extract("remote: git@github.com:acme/shop.git\ncommit 1a2b3c4");
        assert_eq!(
            info.url.as_deref(),
            Some("https://github.com/acme/shop/commit/1a2b3c4")
        );
    }

    #[test]
    fn test_github_deep_link_trimmed() {
        let info = extract("see https://github.com/acme/shop/pull/12 and commit 1a2b3c4");
        assert_eq!(
            info.url.as_deref(),
            Some("https://github.com/acme/shop/commit/1a2b3c4")
        );
    }

    #[test]
    fn test_gitlab_subgroup_url() {
        let info = extract(
            "Remote https://gitlab.com/org/team/app/-/merge_requests/3\ncommit 1a2b3c4d",
        );
        assert_eq!(
            info.url.as_deref(),
            Some("https://gitlab.com/org/team/app/-/commit/1a2b3c4d")
        );
    }

    #[test]
    fn test_remote_without_hash_yields_nothing() {
        let info = extract("origin https://github.com/acme/shop");
        assert_eq!(info, CommitInfo::default());
    }

    #[test]
    fn test_other_hosts_ignored() {
        let info = extract("https://bitbucket.org/acme/shop\ncommit 1a2b3c4");
        assert_eq!(info.hash.as_deref(), Some("1a2b3c4"));
        assert!(info.url.is_none());
    }

    #[test]
    fn test_idempotent() {
        let out = "git@gitlab.com:a/b.git\n[main (root-commit) 1a2b3c4] x\nCommitted";
        assert_eq!(extract(out), extract(out));
    }
}

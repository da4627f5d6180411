//! Canonical workspace-id derivation.
//!
//! Clients derive the canonical id before emitting events; the server keeps
//! the same algorithm so the two sides cannot drift. Two clients pointing
//! at the same remote must produce identical canonical ids.

/// Canonical id for repositories with no git context at all.
pub const UNASSOCIATED: &str = "_unassociated";

/// Derive the canonical workspace id from a git remote URL and an optional
/// first-commit hash.
///
/// Precedence: remote, then `local:<first-commit-hash>`, then
/// [`UNASSOCIATED`].
#[must_use]
pub fn derive_canonical_id(git_remote: Option<&str>, first_commit: Option<&str>) -> String {
    if let Some(remote) = git_remote {
        let remote = remote.trim();
        if !remote.is_empty() {
            return normalize_remote(remote);
        }
    }
    if let Some(hash) = first_commit {
        let hash = hash.trim();
        if !hash.is_empty() {
            return format!("local:{hash}");
        }
    }
    UNASSOCIATED.to_owned()
}

/// Normalize a git remote URL to `<host>/<path>`: protocol stripped, SSH
/// form folded into the HTTPS form, trailing `.git` dropped, host
/// lowercased.
#[must_use]
pub fn normalize_remote(remote: &str) -> String {
    let remote = remote.trim().trim_end_matches('/');

    // git@host:org/repo -> host/org/repo
    let stripped = if let Some(rest) = remote.strip_prefix("git@") {
        rest.replacen(':', "/", 1)
    } else if let Some(rest) = remote.strip_prefix("ssh://git@") {
        rest.to_owned()
    } else if let Some(rest) = remote.strip_prefix("https://") {
        rest.to_owned()
    } else if let Some(rest) = remote.strip_prefix("http://") {
        rest.to_owned()
    } else {
        remote.to_owned()
    };

    let stripped = stripped.trim_end_matches('/');
    let stripped = stripped.strip_suffix(".git").unwrap_or(stripped);

    match stripped.split_once('/') {
        Some((host, path)) => format!("{}/{}", host.to_lowercase(), path),
        None => stripped.to_lowercase(),
    }
}

/// Display name for a workspace, from the last path segment of its
/// canonical id.
#[must_use]
pub fn display_name_for(canonical_id: &str) -> String {
    if canonical_id == UNASSOCIATED {
        return "unassociated".to_owned();
    }
    if let Some(hash) = canonical_id.strip_prefix("local:") {
        let short = &hash[..hash.len().min(12)];
        return format!("local-{short}");
    }
    canonical_id
        .rsplit('/')
        .next()
        .unwrap_or(canonical_id)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_https_remote() {
        assert_eq!(
            normalize_remote("https://github.com/user/repo.git"),
            "github.com/user/repo"
        );
    }

    #[test]
    fn test_ssh_remote_matches_https() {
        assert_eq!(
            normalize_remote("git@github.com:user/repo.git"),
            normalize_remote("https://github.com/user/repo"),
        );
    }

    #[test]
    fn test_ssh_protocol_url() {
        assert_eq!(
            normalize_remote("ssh://git@gitlab.com/group/project.git"),
            "gitlab.com/group/project"
        );
    }

    #[test]
    fn test_host_is_lowercased_path_is_not() {
        assert_eq!(
            normalize_remote("https://GitHub.COM/User/Repo"),
            "github.com/User/Repo"
        );
    }

    #[test]
    fn test_trailing_slash_dropped() {
        assert_eq!(
            normalize_remote("https://github.com/user/repo/"),
            "github.com/user/repo"
        );
    }

    #[test]
    fn test_local_fallback() {
        assert_eq!(
            derive_canonical_id(None, Some("abc123")),
            "local:abc123"
        );
        assert_eq!(derive_canonical_id(Some("  "), Some("abc123")), "local:abc123");
    }

    #[test]
    fn test_unassociated_fallback() {
        assert_eq!(derive_canonical_id(None, None), UNASSOCIATED);
        assert_eq!(derive_canonical_id(Some(""), Some("")), UNASSOCIATED);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(display_name_for("github.com/user/repo"), "repo");
        assert_eq!(display_name_for("local:abcdef0123456789"), "local-abcdef012345");
        assert_eq!(display_name_for(UNASSOCIATED), "unassociated");
    }

    proptest! {
        // The same org/repo must canonicalize identically across URL forms.
        #[test]
        fn prop_ssh_and_https_agree(org in "[a-z][a-z0-9-]{0,12}", repo in "[a-z][a-z0-9-]{0,12}") {
            let ssh = format!("git@github.com:{org}/{repo}.git");
            let https = format!("https://github.com/{org}/{repo}.git");
            prop_assert_eq!(normalize_remote(&ssh), normalize_remote(&https));
        }

        // Derivation is deterministic and never yields an empty id.
        #[test]
        fn prop_never_empty(remote in proptest::option::of("[ -~]{0,40}")) {
            let id = derive_canonical_id(remote.as_deref(), None);
            prop_assert!(!id.is_empty());
            prop_assert_eq!(id.clone(), derive_canonical_id(remote.as_deref(), None));
        }
    }
}

//! Protection and permission rule types plus pattern matching.
//!
//! One glob dialect (via `globset`) covers both branch-protection patterns
//! and path-permission patterns, so `release/*` and `infra/*` behave
//! consistently.  `*` crosses `/` boundaries, matching the loose prefix
//! semantics repository administrators expect from trailing-wildcard rules.

use globset::Glob;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Rule types
// ---------------------------------------------------------------------------

/// One pattern-scoped branch protection policy for a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchProtectionRule {
    pub pattern: String,
    pub requires_pr: bool,
    pub allow_force_pushes: bool,
    pub active: bool,
    /// Storage order, used only as the final tie-breaker.
    pub position: i64,
}

/// One (pattern, grantee) pair restricting writes to matching file paths.
/// Exactly one of `user_id` / `team_id` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathPermissionRule {
    pub path_pattern: String,
    pub user_id: Option<i64>,
    pub team_id: Option<i64>,
}

/// The identity a push arrives under, resolved against the user store.
///
/// `system` actors are authenticated service identities (the scheduler's
/// internal merge path); they bypass the requires-PR and path-permission
/// checks but remain subject to force-push verification.
#[derive(Debug, Clone, Default)]
pub struct ActorIdentity {
    pub username: Option<String>,
    pub user_id: Option<i64>,
    pub team_ids: Vec<i64>,
    pub system: bool,
}

impl ActorIdentity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }
}

// ---------------------------------------------------------------------------
// Glob matching
// ---------------------------------------------------------------------------

/// Match `candidate` against a glob `pattern`.  An unparseable pattern
/// matches nothing (logged, not fatal: a bad stored rule must not take the
/// gate down).
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(candidate),
        Err(e) => {
            warn!(%pattern, error = %e, "unparseable rule pattern; treating as non-matching");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Branch protection resolution
// ---------------------------------------------------------------------------

/// Find the protection rule governing `branch`.
///
/// Precedence is deterministic rather than storage-order-accidental: an
/// exact pattern always wins over a wildcard; among wildcard matches the
/// longest pattern (most specific) wins; remaining ties resolve to the
/// lowest `position`.  Inactive rules never match.
pub fn find_matching_rule<'a>(
    rules: &'a [BranchProtectionRule],
    branch: &str,
) -> Option<&'a BranchProtectionRule> {
    let active = rules.iter().filter(|r| r.active);

    let mut best: Option<&BranchProtectionRule> = None;
    for rule in active {
        let is_exact = !rule.pattern.contains('*');
        let matches = if is_exact {
            rule.pattern == branch
        } else {
            glob_match(&rule.pattern, branch)
        };
        if !matches {
            continue;
        }
        let better = match best {
            None => true,
            Some(current) => {
                let current_exact = !current.pattern.contains('*');
                match (is_exact, current_exact) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => match rule.pattern.len().cmp(&current.pattern.len()) {
                        std::cmp::Ordering::Greater => true,
                        std::cmp::Ordering::Less => false,
                        std::cmp::Ordering::Equal => rule.position < current.position,
                    },
                }
            }
        };
        if better {
            best = Some(rule);
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Path permission checks
// ---------------------------------------------------------------------------

/// Check every changed path against the repository's path permission rules.
///
/// A path matched by no rule is unrestricted.  A path matched by at least
/// one rule is protected: the actor must satisfy some rule that both
/// matches the path and grants them access (directly or via team
/// membership).  Returns the first offending path on violation so the
/// pusher can self-correct.
pub fn check_path_permissions(
    rules: &[PathPermissionRule],
    actor: &ActorIdentity,
    changed_paths: &[String],
) -> Result<(), String> {
    for path in changed_paths {
        let matching: Vec<&PathPermissionRule> = rules
            .iter()
            .filter(|r| glob_match(&r.path_pattern, path))
            .collect();

        if matching.is_empty() {
            continue;
        }

        let granted = matching.iter().any(|rule| rule_grants(rule, actor));
        if !granted {
            return Err(path.clone());
        }
    }
    Ok(())
}

fn rule_grants(rule: &PathPermissionRule, actor: &ActorIdentity) -> bool {
    if let (Some(rule_user), Some(actor_user)) = (rule.user_id, actor.user_id) {
        if rule_user == actor_user {
            return true;
        }
    }
    if let Some(team) = rule.team_id {
        if actor.team_ids.contains(&team) {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, position: i64) -> BranchProtectionRule {
        BranchProtectionRule {
            pattern: pattern.to_string(),
            requires_pr: false,
            allow_force_pushes: true,
            active: true,
            position,
        }
    }

    #[test]
    fn exact_match_wins_over_wildcard() {
        let rules = vec![rule("release/*", 0), rule("release/1.0", 1)];
        let matched = find_matching_rule(&rules, "release/1.0").unwrap();
        assert_eq!(matched.pattern, "release/1.0");
    }

    #[test]
    fn longest_wildcard_wins() {
        let rules = vec![rule("*", 0), rule("release/*", 1)];
        let matched = find_matching_rule(&rules, "release/1.0").unwrap();
        assert_eq!(matched.pattern, "release/*");
    }

    #[test]
    fn position_breaks_remaining_ties() {
        let rules = vec![rule("hotfix/*", 3), rule("hotfi*/*", 1)];
        // Same length; lower position wins.
        let matched = find_matching_rule(&rules, "hotfix/x").unwrap();
        assert_eq!(matched.position, 1);
    }

    #[test]
    fn inactive_rules_never_match() {
        let mut r = rule("main", 0);
        r.active = false;
        assert!(find_matching_rule(&[r], "main").is_none());
    }

    #[test]
    fn no_match_returns_none() {
        let rules = vec![rule("main", 0), rule("release/*", 1)];
        assert!(find_matching_rule(&rules, "feature/x").is_none());
    }

    #[test]
    fn glob_star_crosses_slash() {
        assert!(glob_match("infra/*", "infra/deploy.yaml"));
        assert!(glob_match("infra/*", "infra/k8s/deploy.yaml"));
        assert!(!glob_match("infra/*", "docs/infra.md"));
    }

    #[test]
    fn invalid_pattern_matches_nothing() {
        assert!(!glob_match("infra/[", "infra/x"));
    }

    fn team_rule(pattern: &str, team: i64) -> PathPermissionRule {
        PathPermissionRule {
            path_pattern: pattern.to_string(),
            user_id: None,
            team_id: Some(team),
        }
    }

    #[test]
    fn unprotected_paths_pass_for_anyone() {
        let rules = vec![team_rule("infra/*", 7)];
        let outsider = ActorIdentity {
            username: Some("mallory".into()),
            user_id: Some(99),
            team_ids: vec![],
            system: false,
        };
        assert!(check_path_permissions(&rules, &outsider, &["README.md".into()]).is_ok());
    }

    #[test]
    fn protected_path_rejected_with_offender_named() {
        let rules = vec![team_rule("infra/*", 7)];
        let outsider = ActorIdentity {
            username: Some("mallory".into()),
            user_id: Some(99),
            team_ids: vec![],
            system: false,
        };
        let changed = vec!["infra/deploy.yaml".to_string(), "README.md".to_string()];
        let err = check_path_permissions(&rules, &outsider, &changed).unwrap_err();
        assert_eq!(err, "infra/deploy.yaml");
    }

    #[test]
    fn team_membership_grants_access() {
        let rules = vec![team_rule("infra/*", 7)];
        let member = ActorIdentity {
            username: Some("alice".into()),
            user_id: Some(1),
            team_ids: vec![7],
            system: false,
        };
        let changed = vec!["infra/deploy.yaml".to_string()];
        assert!(check_path_permissions(&rules, &member, &changed).is_ok());
    }

    #[test]
    fn direct_user_grant_works() {
        let rules = vec![PathPermissionRule {
            path_pattern: "docs/*".to_string(),
            user_id: Some(42),
            team_id: None,
        }];
        let writer = ActorIdentity {
            username: Some("bob".into()),
            user_id: Some(42),
            team_ids: vec![],
            system: false,
        };
        assert!(check_path_permissions(&rules, &writer, &["docs/a.md".into()]).is_ok());
    }
}

//! Matching local entities to remote issues by title.
//!
//! Used only for local entities that have neither a remote key nor a base
//! snapshot: before creating a new issue, the unclaimed remote children of
//! the epic are searched for one that is evidently the same work item.

/// Decides whether a local title and a remote title name the same item.
pub trait TitleMatcher: Send + Sync {
    fn matches(&self, local: &str, remote: &str) -> bool;

    /// Index of the best candidate for `local`, if any.
    fn best_match(&self, local: &str, candidates: &[&str]) -> Option<usize> {
        candidates.iter().position(|candidate| self.matches(local, candidate))
    }
}

/// Normalizes both titles, then accepts equality or containment.
///
/// Normalization strips a leading `KEY-12:` / `US-3:` style prefix,
/// lowercases, drops punctuation and collapses whitespace. Containment is
/// only considered when the shorter title has at least `min_len` characters.
#[derive(Debug, Clone, Copy)]
pub struct NormalizedContainmentMatcher {
    min_len: usize,
}

impl Default for NormalizedContainmentMatcher {
    fn default() -> Self {
        Self { min_len: 4 }
    }
}

impl NormalizedContainmentMatcher {
    #[must_use]
    pub const fn with_min_len(min_len: usize) -> Self {
        Self { min_len }
    }
}

impl TitleMatcher for NormalizedContainmentMatcher {
    fn matches(&self, local: &str, remote: &str) -> bool {
        let local = normalize_title(local);
        let remote = normalize_title(remote);
        if local.is_empty() || remote.is_empty() {
            return false;
        }
        if local == remote {
            return true;
        }
        let (short, long) = if local.len() <= remote.len() {
            (&local, &remote)
        } else {
            (&remote, &local)
        };
        short.chars().count() >= self.min_len && long.contains(short.as_str())
    }

    /// Exact normalized equality beats containment.
    fn best_match(&self, local: &str, candidates: &[&str]) -> Option<usize> {
        let wanted = normalize_title(local);
        if wanted.is_empty() {
            return None;
        }
        candidates
            .iter()
            .position(|c| normalize_title(c) == wanted)
            .or_else(|| candidates.iter().position(|c| self.matches(local, c)))
    }
}

/// Canonical form of a title for matching.
#[must_use]
pub fn normalize_title(title: &str) -> String {
    let stripped = strip_id_prefix(title.trim());
    let cleaned: String = stripped
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `"US-12: Login"` → `"Login"`. A prefix is a single token before `:` that
/// contains a digit.
fn strip_id_prefix(title: &str) -> &str {
    let Some((head, rest)) = title.split_once(':') else {
        return title;
    };
    let head = head.trim();
    let is_id = !head.is_empty()
        && !head.contains(char::is_whitespace)
        && head.chars().any(|c| c.is_ascii_digit())
        && head.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '#'));
    if is_id { rest.trim_start() } else { title }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_and_punctuation_are_ignored() {
        assert_eq!(normalize_title("US-12: Login  Page!"), "login page");
        assert_eq!(normalize_title("PROJ-7:Checkout"), "checkout");
        assert_eq!(normalize_title("Note: keep this"), "note keep this");
    }

    #[test]
    fn equality_and_containment() {
        let m = NormalizedContainmentMatcher::default();
        assert!(m.matches("US-1: User login", "user login"));
        assert!(m.matches("User login", "User login via SSO"));
        assert!(!m.matches("Login", "Logout flow"));
        assert!(!m.matches("UI", "Build UI shell"));
        assert!(!m.matches("", "anything"));
    }

    #[test]
    fn exact_match_preferred_over_containment() {
        let m = NormalizedContainmentMatcher::default();
        let candidates = ["Payment flow redesign", "payment flow"];
        assert_eq!(m.best_match("Payment Flow", &candidates), Some(1));
        assert_eq!(m.best_match("Payment", &candidates), Some(0));
        assert_eq!(m.best_match("Search", &candidates), None);
    }
}

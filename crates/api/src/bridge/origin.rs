//! Origin allow-list for socket upgrades.

use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("origin {0:?} is not allowed")]
    OriginNotAllowed(String),
    #[error("origin header missing")]
    MissingOrigin,
}

/// Empty allow-list = allow all.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: Arc<[String]>,
}

impl OriginPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed: Vec<String> = allowed
            .into_iter()
            .map(|o| normalize(o.as_ref()))
            .filter(|o| !o.is_empty())
            .collect();
        Self {
            allowed: allowed.into(),
        }
    }

    pub fn is_restricted(&self) -> bool {
        !self.allowed.is_empty()
    }

    pub fn check(&self, origin: Option<&str>) -> Result<(), PolicyViolation> {
        if !self.is_restricted() {
            return Ok(());
        }
        let origin = origin.ok_or(PolicyViolation::MissingOrigin)?;
        let normalized = normalize(origin);
        if self.allowed.iter().any(|a| *a == normalized) {
            Ok(())
        } else {
            Err(PolicyViolation::OriginNotAllowed(origin.to_string()))
        }
    }
}

// Scheme and host are case-insensitive; browsers never send a trailing slash.
fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listed_origin_is_accepted_and_others_rejected() {
        let policy = OriginPolicy::new(["https://a.test"]);
        assert_eq!(policy.check(Some("https://a.test")), Ok(()));
        assert_eq!(
            policy.check(Some("https://b.test")),
            Err(PolicyViolation::OriginNotAllowed("https://b.test".into()))
        );
    }

    #[test]
    fn empty_list_allows_everything() {
        let policy = OriginPolicy::new(Vec::<String>::new());
        assert!(!policy.is_restricted());
        assert!(policy.check(Some("https://anything.test")).is_ok());
        assert!(policy.check(None).is_ok());
    }

    #[test]
    fn restricted_policy_requires_an_origin() {
        let policy = OriginPolicy::new(["https://a.test"]);
        assert_eq!(policy.check(None), Err(PolicyViolation::MissingOrigin));
    }

    #[test]
    fn comparison_ignores_case_and_trailing_slash() {
        let policy = OriginPolicy::new(["https://App.Example.test/"]);
        assert!(policy.check(Some("https://app.example.test")).is_ok());
        assert!(policy.check(Some("http://app.example.test")).is_err());
    }
}

//! Token expiry evaluation.
//!
//! Pure check over stored credential metadata; callers decide whether an
//! invalid result should trigger a refresh.

use crate::store::CredentialStatus;
use chrono::{DateTime, Utc};

/// Outcome of a validity check.
#[derive(Clone, Debug, PartialEq)]
pub enum Validity {
    Valid,
    /// No credential stored for this user
    NotFound,
    /// `expires_at` is at or before the evaluation time
    Expired,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }

    /// Reason string for invalid outcomes, as reported at the API boundary.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Validity::Valid => None,
            Validity::NotFound => Some("not found"),
            Validity::Expired => Some("expired"),
        }
    }
}

/// Evaluates whether a stored credential is currently usable.
///
/// Absent credential is invalid; a present `expires_at` at or before `now`
/// is invalid; anything else (including no recorded expiry) is valid.
/// Takes `now` explicitly so the check stays a pure function.
pub fn check_validity(status: Option<&CredentialStatus>, now: DateTime<Utc>) -> Validity {
    let Some(status) = status else {
        return Validity::NotFound;
    };

    match status.expires_at {
        Some(expires_at) if expires_at <= now => Validity::Expired,
        _ => Validity::Valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn status_with_expiry(expires_at: Option<DateTime<Utc>>) -> CredentialStatus {
        CredentialStatus {
            email: "user@example.com".to_string(),
            display_name: "User".to_string(),
            expires_at,
        }
    }

    #[test]
    fn test_absent_credential_not_found() {
        let v = check_validity(None, Utc::now());
        assert!(!v.is_valid());
        assert_eq!(v.reason(), Some("not found"));
    }

    #[test]
    fn test_past_expiry_invalid() {
        let now = Utc::now();
        let status = status_with_expiry(Some(now - Duration::seconds(1)));
        let v = check_validity(Some(&status), now);
        assert!(!v.is_valid());
        assert_eq!(v.reason(), Some("expired"));
    }

    #[test]
    fn test_exact_expiry_invalid() {
        let now = Utc::now();
        let status = status_with_expiry(Some(now));
        assert_eq!(check_validity(Some(&status), now), Validity::Expired);
    }

    #[test]
    fn test_future_expiry_valid() {
        let now = Utc::now();
        let status = status_with_expiry(Some(now + Duration::hours(1)));
        let v = check_validity(Some(&status), now);
        assert!(v.is_valid());
        assert_eq!(v.reason(), None);
    }

    #[test]
    fn test_no_expiry_valid() {
        let status = status_with_expiry(None);
        assert!(check_validity(Some(&status), Utc::now()).is_valid());
    }
}

//! Failure classification and retry backoff

use chrono::Duration;

/// Error fragments that indicate the address will never accept mail
const PERMANENT_PATTERNS: &[&str] = &[
    "invalid email",
    "email address is invalid",
    "domain not found",
    "domain does not exist",
    "user not found",
    "mailbox not found",
    "recipient address rejected",
    "address rejected",
    "does not exist",
    "undeliverable",
    "permanent failure",
];

/// Error fragments that indicate a transient condition worth retrying
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "temporar",
    "try again",
    "rate limit",
    "mailbox full",
    "quota exceeded",
    "service unavailable",
    "connection",
    "network",
];

/// Permanent failures that should be recorded as hard bounces rather
/// than generic failures
const HARD_BOUNCE_PATTERNS: &[&str] = &[
    "user unknown",
    "user not found",
    "mailbox not found",
    "does not exist",
    "domain not found",
    "5.1.1",
    "550",
];

/// Delivery error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Permanent,
    Transient,
    Unknown,
}

/// Classify a transport error message.
///
/// Hard-bounce fragments count as permanent: a nonexistent mailbox will
/// not appear by retrying.
pub fn classify(error: &str) -> ErrorClass {
    let lower = error.to_lowercase();

    if PERMANENT_PATTERNS
        .iter()
        .chain(HARD_BOUNCE_PATTERNS)
        .any(|p| lower.contains(p))
    {
        return ErrorClass::Permanent;
    }
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Transient;
    }
    ErrorClass::Unknown
}

/// Whether a permanent failure should be recorded as a hard bounce
pub fn is_hard_bounce(error: &str) -> bool {
    let lower = error.to_lowercase();
    HARD_BOUNCE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Decide whether a failed send should be retried.
///
/// Permanent errors never retry. Unknown errors default to retry so a
/// misclassified transient condition cannot strand a recipient.
pub fn should_retry(error: &str, retry_count: i32, max_retry_attempts: i32) -> bool {
    if retry_count >= max_retry_attempts {
        return false;
    }
    classify(error) != ErrorClass::Permanent
}

/// Exponential backoff before the next attempt: 1, 2, 4, 8, ... minutes
pub fn backoff_delay(retry_count: i32) -> Duration {
    let exponent = (retry_count - 1).clamp(0, 10) as u32;
    Duration::minutes(2i64.pow(exponent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_classify_permanent() {
        assert_eq!(
            classify("550 5.1.1 Recipient address rejected: User unknown"),
            ErrorClass::Permanent
        );
        assert_eq!(classify("Domain not found"), ErrorClass::Permanent);
        assert_eq!(
            classify("Mailbox not found at this server"),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_classify_transient() {
        assert_eq!(classify("Connection timeout"), ErrorClass::Transient);
        assert_eq!(
            classify("451 Temporary local problem, try again later"),
            ErrorClass::Transient
        );
        assert_eq!(classify("Rate limit exceeded"), ErrorClass::Transient);
        assert_eq!(classify("Mailbox full"), ErrorClass::Transient);
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(classify("something odd happened"), ErrorClass::Unknown);
    }

    #[test]
    fn test_should_retry_defaults_to_retry_for_unknown() {
        assert!(should_retry("something odd happened", 0, 3));
    }

    #[test]
    fn test_should_retry_permanent_never_retries() {
        assert!(!should_retry("Recipient address rejected", 0, 3));
    }

    #[test]
    fn test_hard_bounces_are_permanent_and_never_retried() {
        assert_eq!(classify("550 5.1.1 User unknown"), ErrorClass::Permanent);
        assert_eq!(classify("554 user unknown"), ErrorClass::Permanent);
        assert!(!should_retry("550 5.1.1 User unknown", 0, 3));
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        assert!(should_retry("timeout", 2, 3));
        assert!(!should_retry("timeout", 3, 3));
        assert!(!should_retry("timeout", 4, 3));
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1), Duration::minutes(1));
        assert_eq!(backoff_delay(2), Duration::minutes(2));
        assert_eq!(backoff_delay(3), Duration::minutes(4));
        assert_eq!(backoff_delay(4), Duration::minutes(8));
    }

    #[test]
    fn test_hard_bounce_detection() {
        assert!(is_hard_bounce("550 5.1.1 User unknown"));
        assert!(is_hard_bounce("mailbox not found"));
        assert!(!is_hard_bounce("invalid email syntax"));
    }
}

//! Wait-time policy for failed Slack API calls.

use std::time::Duration;

use rand::Rng;

const DEFAULT_RATE_LIMIT_HINT: Duration = Duration::from_secs(10);
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(180);
const TRANSIENT_WAIT_SECS: (f64, f64) = (10.0, 30.0);
const RATE_LIMIT_JITTER: (f64, f64) = (0.1, 0.3);

const TRANSIENT_CODES: &[&str] = &[
    "timeout",
    "service_unavailable",
    "fatal_error",
    "internal_error",
    "request_timeout",
    "transport_error",
];

const TERMINAL_CODES: &[&str] = &[
    "channel_not_found",
    "is_archived",
    "not_in_channel",
    "access_denied",
    "invalid_auth",
    "not_authed",
    "account_inactive",
    "token_revoked",
    "missing_scope",
    "thread_not_found",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    Transient,
    Terminal,
    Unclassified,
}

impl ErrorClass {
    pub fn from_code(code: &str) -> Self {
        if code == "ratelimited" || code == "rate_limited" {
            ErrorClass::RateLimited
        } else if TRANSIENT_CODES.contains(&code) {
            ErrorClass::Transient
        } else if TERMINAL_CODES.contains(&code) {
            ErrorClass::Terminal
        } else {
            ErrorClass::Unclassified
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::RateLimited | ErrorClass::Transient)
    }
}

/// How long to wait before retrying, or `None` when the error must not be retried.
///
/// Rate limits wait the server hint plus 10-30% jitter, capped at 180s.
/// Transient faults wait a uniform 10-30s.
pub fn wait_for<R: Rng + ?Sized>(
    class: ErrorClass,
    hint: Option<Duration>,
    rng: &mut R,
) -> Option<Duration> {
    match class {
        ErrorClass::RateLimited => {
            let hint = hint.unwrap_or(DEFAULT_RATE_LIMIT_HINT).as_secs_f64();
            let jitter = if hint > 0.0 {
                rng.gen_range(hint * RATE_LIMIT_JITTER.0..=hint * RATE_LIMIT_JITTER.1)
            } else {
                0.0
            };
            let wait = (hint + jitter).min(MAX_RATE_LIMIT_WAIT.as_secs_f64());
            Some(Duration::from_secs_f64(wait))
        }
        ErrorClass::Transient => {
            let (low, high) = TRANSIENT_WAIT_SECS;
            Some(Duration::from_secs_f64(rng.gen_range(low..=high)))
        }
        ErrorClass::Terminal | ErrorClass::Unclassified => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_classifies_rate_limit() {
        assert_eq!(ErrorClass::from_code("ratelimited"), ErrorClass::RateLimited);
    }

    #[test]
    fn test_classifies_transient_codes() {
        for code in ["timeout", "service_unavailable", "fatal_error", "transport_error"] {
            assert_eq!(ErrorClass::from_code(code), ErrorClass::Transient, "{code}");
        }
    }

    #[test]
    fn test_classifies_terminal_codes() {
        let codes = [
            "channel_not_found",
            "is_archived",
            "access_denied",
            "invalid_auth",
            "token_revoked",
        ];
        for code in codes {
            assert_eq!(ErrorClass::from_code(code), ErrorClass::Terminal, "{code}");
        }
    }

    #[test]
    fn test_only_rate_limits_and_transient_faults_retry() {
        assert!(ErrorClass::RateLimited.is_retryable());
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::Terminal.is_retryable());
        assert!(!ErrorClass::Unclassified.is_retryable());
    }

    #[test]
    fn test_unknown_code_is_unclassified_and_not_retryable() {
        let class = ErrorClass::from_code("something_new");
        assert_eq!(class, ErrorClass::Unclassified);
        assert!(!class.is_retryable());
    }

    #[test]
    fn test_rate_limit_wait_within_jitter_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let wait = wait_for(ErrorClass::RateLimited, Some(Duration::from_secs(5)), &mut rng)
                .unwrap_or_default()
                .as_secs_f64();
            assert!((5.5..=6.5).contains(&wait), "wait {wait}");
        }
    }

    #[test]
    fn test_rate_limit_wait_capped() {
        let mut rng = StdRng::seed_from_u64(1);
        let wait = wait_for(ErrorClass::RateLimited, Some(Duration::from_secs(1000)), &mut rng);
        assert_eq!(wait, Some(Duration::from_secs(180)));
    }

    #[test]
    fn test_rate_limit_default_hint() {
        let mut rng = StdRng::seed_from_u64(3);
        let wait = wait_for(ErrorClass::RateLimited, None, &mut rng)
            .unwrap_or_default()
            .as_secs_f64();
        assert!((11.0..=13.0).contains(&wait), "wait {wait}");
    }

    #[test]
    fn test_transient_wait_range() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let wait = wait_for(ErrorClass::Transient, None, &mut rng)
                .unwrap_or_default()
                .as_secs_f64();
            assert!((10.0..=30.0).contains(&wait), "wait {wait}");
        }
    }

    #[test]
    fn test_terminal_and_unclassified_do_not_wait() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(wait_for(ErrorClass::Terminal, Some(Duration::from_secs(5)), &mut rng), None);
        assert_eq!(wait_for(ErrorClass::Unclassified, None, &mut rng), None);
    }

    #[test]
    fn test_same_seed_same_wait() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let hint = Some(Duration::from_secs(20));
        assert_eq!(
            wait_for(ErrorClass::RateLimited, hint, &mut a),
            wait_for(ErrorClass::RateLimited, hint, &mut b)
        );
    }
}

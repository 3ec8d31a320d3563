use crate::config::Settings;
use regex::Regex;

/// What a finished upstream attempt looked like before classification.
#[derive(Debug)]
pub enum AttemptOutcome<'a> {
    /// The request never produced an HTTP response (connect failure, TLS
    /// error, read timeout, mid-body disconnect).
    Transport { message: &'a str },
    /// An HTTP response with its status and (possibly partial) body text.
    Http { status: u16, body: &'a str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 2xx and clean: feed the response to the broadcaster.
    Success,
    /// Counts against the provider's health and allows failover.
    Retryable,
    /// Published to the client as-is; does not touch health.
    NonRetryable,
}

/// Classify an attempt outcome.
///
/// Examination order is fixed: exception patterns, then status codes, then
/// body patterns, then the 2xx success check. The first rule that fires
/// wins, so an unhealthy-listed status is retryable even when the body looks
/// benign.
pub fn classify(
    settings: &Settings,
    body_patterns: &[Regex],
    outcome: &AttemptOutcome<'_>,
) -> Classification {
    match outcome {
        AttemptOutcome::Transport { message } => {
            let haystack = message.to_lowercase();
            let matched = settings
                .unhealthy_exception_patterns
                .iter()
                .any(|pattern| haystack.contains(&pattern.to_lowercase()));
            if matched {
                Classification::Retryable
            } else {
                Classification::NonRetryable
            }
        }
        AttemptOutcome::Http { status, body } => {
            if settings.unhealthy_http_codes.contains(status) {
                return Classification::Retryable;
            }
            if body_patterns.iter().any(|re| re.is_match(body)) {
                return Classification::Retryable;
            }
            if (200..300).contains(status) {
                return Classification::Success;
            }
            Classification::NonRetryable
        }
    }
}

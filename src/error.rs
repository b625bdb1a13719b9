//! Error taxonomy shared by every component (§7 of the design).
//!
//! Every fallible operation in this crate returns a [`HarvestError`] rather than
//! panicking or a stringly-typed error, so callers can dispatch on
//! [`HarvestError::category`] to decide whether to retry, skip, or abort.

use std::fmt;

/// Coarse-grained bucket a [`HarvestError`] falls into, driving retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Worth retrying with backoff: network hiccups, translation-server contention.
    Transient,
    /// This item is done for; log and move on.
    Terminal,
    /// Not actually an error — a policy decision (robots, language, already-delivered).
    Policy,
    /// Configuration or environment is broken; abort the whole run.
    Fatal,
}

/// The full error taxonomy. Variant names mirror the §7 table directly so that
/// log lines and metrics keyed off `Display` read the same as the design doc.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HarvestError {
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("DNS resolution failed: {0}")]
    DnsFailure(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("too many redirects (limit {limit})")]
    TooManyRedirects { limit: u32 },
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("denied by robots.txt")]
    DeniedByRobots,
    #[error("response language not in acceptable set")]
    UnacceptableLanguage,
    #[error("document exceeded the size cap ({0} bytes)")]
    DocumentTooLarge(usize),
    #[error("HTTP {0}")]
    HttpStatus(u16),
    #[error("translation server reported an internal error")]
    TranslationError,
    #[error("no translator available for this page")]
    TranslationUnavailable,
    #[error("translation server is busy, gave up waiting for a slot")]
    TranslationServerBusy,
    #[error("item was already delivered")]
    AlreadyDelivered,
    #[error("URL does not match any configured target pattern")]
    UnsupportedUrl,
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl HarvestError {
    /// Which bucket this error falls into, per the §7 taxonomy table.
    pub fn category(&self) -> ErrorCategory {
        use HarvestError::*;
        match self {
            Timeout(_) | DnsFailure(_) | ConnectionRefused(_) | TranslationServerBusy => {
                ErrorCategory::Transient
            }
            HttpStatus(code) if (500..600).contains(code) => ErrorCategory::Transient,
            HttpStatus(_)
            | TooManyRedirects { .. }
            | ProtocolError(_)
            | DocumentTooLarge(_)
            | TranslationError
            | TranslationUnavailable
            | InvalidUrl(_) => ErrorCategory::Terminal,
            DeniedByRobots | UnacceptableLanguage | AlreadyDelivered | UnsupportedUrl => ErrorCategory::Policy,
            Configuration(_) | Io(_) => ErrorCategory::Fatal,
        }
    }

    /// A short machine-stable label, used as a counter key by the progress logger.
    pub fn kind_label(&self) -> &'static str {
        use HarvestError::*;
        match self {
            Timeout(_) => "timeout",
            DnsFailure(_) => "dns_failure",
            ConnectionRefused(_) => "connection_refused",
            TooManyRedirects { .. } => "too_many_redirects",
            ProtocolError(_) => "protocol_error",
            DeniedByRobots => "denied_by_robots",
            UnacceptableLanguage => "unacceptable_language",
            DocumentTooLarge(_) => "document_too_large",
            HttpStatus(_) => "http_status",
            TranslationError => "translation_error",
            TranslationUnavailable => "translation_unavailable",
            TranslationServerBusy => "translation_server_busy",
            AlreadyDelivered => "already_delivered",
            UnsupportedUrl => "unsupported_url",
            InvalidUrl(_) => "invalid_url",
            Configuration(_) => "configuration",
            Io(_) => "io",
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HarvestError::Timeout(std::time::Duration::from_secs(0))
        } else if err.is_connect() {
            HarvestError::ConnectionRefused(err.to_string())
        } else if let Some(status) = err.status() {
            HarvestError::HttpStatus(status.as_u16())
        } else {
            HarvestError::ProtocolError(err.to_string())
        }
    }
}

impl From<url::ParseError> for HarvestError {
    fn from(err: url::ParseError) -> Self {
        HarvestError::InvalidUrl(err.to_string())
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(err: serde_json::Error) -> Self {
        HarvestError::ProtocolError(format!("malformed JSON: {err}"))
    }
}

impl From<std::io::Error> for HarvestError {
    fn from(err: std::io::Error) -> Self {
        HarvestError::Io(err.to_string())
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Terminal => "terminal",
            ErrorCategory::Policy => "policy",
            ErrorCategory::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retried() {
        assert_eq!(HarvestError::Timeout(Default::default()).category(), ErrorCategory::Transient);
        assert_eq!(HarvestError::TranslationServerBusy.category(), ErrorCategory::Transient);
        assert_eq!(HarvestError::HttpStatus(503).category(), ErrorCategory::Transient);
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        assert_eq!(HarvestError::HttpStatus(404).category(), ErrorCategory::Terminal);
        assert_eq!(HarvestError::TranslationError.category(), ErrorCategory::Terminal);
        assert_eq!(HarvestError::TranslationUnavailable.category(), ErrorCategory::Terminal);
    }

    #[test]
    fn policy_outcomes_are_not_errors_in_spirit() {
        assert_eq!(HarvestError::DeniedByRobots.category(), ErrorCategory::Policy);
        assert_eq!(HarvestError::AlreadyDelivered.category(), ErrorCategory::Policy);
    }
}

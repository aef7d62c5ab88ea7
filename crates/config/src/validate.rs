//! Semantic checks on a loaded configuration.

use secrecy::ExposeSecret;

use crate::schema::CourierConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "queue.max_size"
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Check a configuration for values the runtime cannot work with.
#[must_use]
pub fn validate(config: &CourierConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.telegram.token.expose_secret().trim().is_empty() {
        result.push(
            Severity::Error,
            "telegram.token",
            "bot token is empty (set it in the config or COURIER_TELEGRAM_TOKEN)",
        );
    }

    if let Some(raw) = &config.telegram.push_url {
        match url::Url::parse(raw) {
            Ok(url) if url.scheme() != "https" => result.push(
                Severity::Warning,
                "telegram.push_url",
                format!("Telegram only delivers webhooks over https, got {}", url.scheme()),
            ),
            Ok(_) => {},
            Err(e) => result.push(
                Severity::Error,
                "telegram.push_url",
                format!("invalid url: {e}"),
            ),
        }
    }

    let queue = &config.queue;
    if queue.max_size == 0 {
        result.push(Severity::Error, "queue.max_size", "must be greater than 0");
    }
    if queue.max_retries == 0 {
        result.push(Severity::Error, "queue.max_retries", "must be at least 1");
    }
    if queue.dedup_retain > queue.dedup_capacity {
        result.push(
            Severity::Error,
            "queue.dedup_retain",
            format!(
                "cannot exceed dedup_capacity ({} > {})",
                queue.dedup_retain, queue.dedup_capacity
            ),
        );
    }

    if config.transport.pull_error_threshold == 0 {
        result.push(
            Severity::Warning,
            "transport.pull_error_threshold",
            "0 switches to push on the first pull error",
        );
    }

    if config.health.interval_secs == 0 {
        result.push(Severity::Error, "health.interval_secs", "must be greater than 0");
    }
    if config.health.max_failures == 0 {
        result.push(Severity::Error, "health.max_failures", "must be at least 1");
    }
    for (i, service) in config.health.services.iter().enumerate() {
        if url::Url::parse(&service.url).is_err() {
            result.push(
                Severity::Error,
                &format!("health.services[{i}].url"),
                format!("invalid probe url for service {:?}", service.name),
            );
        }
    }

    if let Some(raw) = &config.dispatch.forward_url
        && url::Url::parse(raw).is_err()
    {
        result.push(Severity::Error, "dispatch.forward_url", "invalid url");
    }

    result
}

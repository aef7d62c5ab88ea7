use {
    courier_ingest::{Envelope, EnvelopeClassifier, Priority},
    serde_json::Value,
};

/// Priority from the shape of a raw Telegram update.
///
/// Configured critical commands (and admin commands) jump to the front of
/// the queue; only the critical ones bypass a full queue.
pub struct TelegramClassifier {
    critical: Vec<String>,
    admin: Vec<String>,
}

impl TelegramClassifier {
    #[must_use]
    pub fn new(config: &courier_config::TelegramConfig) -> Self {
        Self {
            critical: config.critical_commands.clone(),
            admin: config.admin_commands.clone(),
        }
    }

    fn matches(list: &[String], command: &str) -> bool {
        list.iter().any(|c| c.eq_ignore_ascii_case(command))
    }
}

/// Leading `/command` of a message, without any `@botname` suffix.
fn command(payload: &Value) -> Option<&str> {
    let text = payload
        .get("message")
        .or_else(|| payload.get("edited_message"))?
        .get("text")?
        .as_str()?;
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    Some(first.split_once('@').map_or(first, |(cmd, _)| cmd))
}

impl EnvelopeClassifier for TelegramClassifier {
    fn priority(&self, envelope: &Envelope) -> Priority {
        let payload = envelope.payload();
        if let Some(cmd) = command(payload)
            && (Self::matches(&self.critical, cmd) || Self::matches(&self.admin, cmd))
        {
            return Priority::Critical;
        }
        if ["message", "edited_message", "channel_post"]
            .iter()
            .any(|k| payload.get(k).is_some())
        {
            Priority::Normal
        } else if ["callback_query", "inline_query"]
            .iter()
            .any(|k| payload.get(k).is_some())
        {
            Priority::Callback
        } else {
            Priority::Low
        }
    }

    fn is_critical(&self, envelope: &Envelope) -> bool {
        command(envelope.payload()).is_some_and(|cmd| Self::matches(&self.critical, cmd))
    }
}

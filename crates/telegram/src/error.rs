use {
    courier_ingest::RecoveryKind,
    teloxide::{ApiError, RequestError},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Telegram(#[from] RequestError),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error("{message}")]
    Message { message: String },

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Tag a Bot API failure with the remediation it needs so the ingestion
/// classifier does not have to guess from the message text.
#[must_use]
pub fn into_ingest(err: RequestError) -> courier_ingest::Error {
    use courier_ingest::Error as Ingest;

    match &err {
        RequestError::RetryAfter(secs) => {
            let wait = secs.duration();
            Ingest::rate_limited(wait, err)
        },
        RequestError::Network(e) if e.is_timeout() => Ingest::recoverable(RecoveryKind::Timeout, err),
        RequestError::Network(_) | RequestError::Io(_) => {
            Ingest::recoverable(RecoveryKind::Network, err)
        },
        // Polling conflicts with an active webhook or another poller.
        RequestError::Api(ApiError::CantGetUpdates | ApiError::TerminatedByOtherGetUpdates) => {
            Ingest::transport_unavailable(err)
        },
        _ => Ingest::recoverable(RecoveryKind::PlatformApi, err),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, courier_ingest::classify, std::time::Duration, teloxide::types::Seconds};

    #[test]
    fn retry_after_carries_hint() {
        let err = into_ingest(RequestError::RetryAfter(Seconds::from_seconds(7)));
        let classification = classify(&anyhow::Error::new(err));
        assert_eq!(classification.kind, RecoveryKind::RateLimit);
        assert_eq!(classification.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn api_errors_are_platform_api() {
        let err = into_ingest(RequestError::Api(ApiError::BotBlocked));
        assert_eq!(err.recovery_kind(), Some(RecoveryKind::PlatformApi));
    }

    #[test]
    fn polling_conflict_is_transport_unavailable() {
        let err = into_ingest(RequestError::Api(ApiError::CantGetUpdates));
        assert!(matches!(
            err,
            courier_ingest::Error::TransportUnavailable { .. }
        ));
    }
}

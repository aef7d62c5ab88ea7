use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    courier_ingest::{Dispatch, Envelope},
    tracing::{debug, info},
};

/// POSTs each update payload as JSON to an application endpoint.
///
/// Non-2xx answers are errors so the processor retries them; a 429 or 5xx
/// is classified from the status code.
pub struct HttpForwarder {
    client: reqwest::Client,
    url: String,
}

impl HttpForwarder {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Dispatch for HttpForwarder {
    async fn dispatch(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(envelope.payload())
            .send()
            .await?
            .error_for_status()?;
        debug!(update_id = envelope.id(), status = %response.status(), "update forwarded");
        Ok(())
    }
}

/// Logs every update and succeeds. Used when nothing is configured to
/// receive updates.
pub struct LogDispatcher;

#[async_trait]
impl Dispatch for LogDispatcher {
    async fn dispatch(&self, envelope: &Envelope) -> anyhow::Result<()> {
        info!(
            update_id = envelope.id(),
            received_at = %envelope.received_at(),
            "update received"
        );
        Ok(())
    }
}

/// Forwarder when `forward_url` is set, log sink otherwise.
pub fn dispatcher_from_config(
    config: &courier_config::DispatchConfig,
) -> anyhow::Result<Arc<dyn Dispatch>> {
    match &config.forward_url {
        Some(url) => Ok(Arc::new(HttpForwarder::new(
            url.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)),
        None => Ok(Arc::new(LogDispatcher)),
    }
}

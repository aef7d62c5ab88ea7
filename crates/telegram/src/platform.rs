use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use {
    async_trait::async_trait,
    courier_ingest::{Envelope, HealthProbe, Platform},
    secrecy::{ExposeSecret, Secret},
    teloxide::prelude::*,
    tracing::{debug, info, warn},
};

use crate::error::{Error, Result, into_ingest};

/// Extra client-side headroom over the long-poll timeout so the HTTP client
/// does not abort before Telegram answers.
const CLIENT_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

fn build_bot(token: &Secret<String>, timeout: Duration) -> Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(timeout)
        .build()?;
    Ok(Bot::with_client(token.expose_secret(), client))
}

/// [`Platform`] backed by the Telegram Bot API.
pub struct TelegramPlatform {
    token: Secret<String>,
    client_timeout: Duration,
    bot: RwLock<Bot>,
}

impl TelegramPlatform {
    pub fn new(config: &courier_config::TelegramConfig) -> Result<Self> {
        if config.token.expose_secret().is_empty() {
            return Err(Error::message("telegram bot token is empty"));
        }
        let client_timeout = config.poll_timeout() + CLIENT_TIMEOUT_MARGIN;
        Ok(Self {
            bot: RwLock::new(build_bot(&config.token, client_timeout)?),
            token: config.token.clone(),
            client_timeout,
        })
    }

    fn bot(&self) -> Bot {
        self.bot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Verify credentials. Returns the bot username.
    pub async fn get_me(&self) -> Result<Option<String>> {
        let me = self.bot().get_me().await?;
        Ok(me.username.clone())
    }
}

#[async_trait]
impl Platform for TelegramPlatform {
    async fn fetch_updates(&self, offset: i64, timeout: Duration) -> anyhow::Result<Vec<Envelope>> {
        let offset =
            i32::try_from(offset).map_err(|e| Error::external("update offset out of range", e))?;
        let timeout = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);
        let updates = self
            .bot()
            .get_updates()
            .offset(offset)
            .timeout(timeout)
            .await
            .map_err(into_ingest)?;

        let mut envelopes = Vec::with_capacity(updates.len());
        for update in updates {
            let id = i64::from(update.id.as_offset()) - 1;
            match serde_json::to_value(&update) {
                Ok(payload) => envelopes.push(Envelope::new(id, payload)),
                Err(e) => warn!(update_id = id, error = %e, "skipping unserializable update"),
            }
        }
        if !envelopes.is_empty() {
            debug!(count = envelopes.len(), "fetched telegram updates");
        }
        Ok(envelopes)
    }

    async fn register_webhook(&self, url: &str) -> anyhow::Result<()> {
        let url = url::Url::parse(url).map_err(|e| Error::external("invalid webhook url", e))?;
        self.bot()
            .set_webhook(url.clone())
            .await
            .map_err(into_ingest)?;
        info!(%url, "telegram webhook registered");
        Ok(())
    }

    async fn remove_webhook(&self) -> anyhow::Result<()> {
        self.bot()
            .delete_webhook()
            .send()
            .await
            .map_err(into_ingest)?;
        info!("telegram webhook removed");
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        let bot = build_bot(&self.token, self.client_timeout)?;
        *self.bot.write().unwrap_or_else(|e| e.into_inner()) = bot;
        info!("telegram client rebuilt");
        Ok(())
    }
}

/// Healthy while `getMe` succeeds.
pub struct PlatformProbe {
    platform: Arc<TelegramPlatform>,
}

impl PlatformProbe {
    #[must_use]
    pub fn new(platform: Arc<TelegramPlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl HealthProbe for PlatformProbe {
    async fn check(&self) -> anyhow::Result<bool> {
        self.platform.get_me().await?;
        Ok(true)
    }
}

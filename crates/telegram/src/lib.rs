//! Telegram Bot API adapter for the courier ingestion core.
//!
//! Provides the [`Platform`](courier_ingest::Platform) implementation
//! (long polling and webhook registration through teloxide), a `getMe`
//! health probe, and the update classifier that decides queue priority.

pub mod classify;
pub mod error;
pub mod platform;

pub use {
    classify::TelegramClassifier,
    error::{Error, Result, into_ingest},
    platform::{PlatformProbe, TelegramPlatform},
};

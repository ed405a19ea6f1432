//! Telegram channel adapter over the raw Bot API.
//!
//! A long-polling `getUpdates` loop feeds normalized inbound events to the
//! coordinator; outbound sends are chunked, format-fallback'd, and retried
//! on rate limits per the Bot API's `retry_after` hint.

mod adapter;
mod api;

pub use adapter::TelegramChannel;
pub use api::{ApiError, TelegramApi};

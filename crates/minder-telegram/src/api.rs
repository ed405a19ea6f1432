//! Thin typed client for the Telegram Bot API.
//!
//! One method per API call, plus the rate-limit retry helper: HTTP 429
//! replies carry `parameters.retry_after` (seconds); we sleep that long
//! (capped at 30 s) and retry, at most 3 attempts total. Non-429 errors
//! surface after the first failure.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// Cap on how long a server-provided retry hint can make us sleep.
const RETRY_AFTER_CAP_SECS: u64 = 30;
/// Total attempts for a rate-limited call.
const MAX_SEND_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("telegram transport error: {0}")]
    Transport(String),

    #[error("telegram rate limit, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("telegram API error: {description}")]
    Api { description: String },
}

impl ApiError {
    /// Parse-mode rejections are retried once as plain text.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, ApiError::Api { description }
            if description.to_lowercase().contains("can't parse"))
    }

    /// Per-peer voice policy rejections fall back to a generic audio send.
    pub fn is_voice_forbidden(&self) -> bool {
        matches!(self, ApiError::Api { description }
            if description.contains("VOICE_MESSAGES_FORBIDDEN"))
    }
}

// ── Wire DTOs (unknown fields ignored by construction) ───────────────────

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub voice: Option<Voice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Voice {
    pub file_id: String,
    pub duration: u32,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct File {
    pub file_path: Option<String>,
}

pub struct TelegramApi {
    client: reqwest::Client,
    base_url: String,
    file_base_url: String,
}

impl TelegramApi {
    pub fn new(token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
            file_base_url: format!("https://api.telegram.org/file/bot{token}"),
        }
    }

    /// Long-poll for updates. The HTTP timeout rides a few seconds above
    /// the server-side poll timeout.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, ApiError> {
        let url = format!("{}/getUpdates", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", timeout_secs.to_string()),
            ])
            .timeout(Duration::from_secs(timeout_secs + 10))
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        decode_envelope(response).await
    }

    /// Send one text message. `parse_mode` of `None` means plain text.
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = json!(mode);
        }
        self.post_json::<serde_json::Value>("sendMessage", body)
            .await
            .map(|_| ())
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<(), ApiError> {
        self.post_json::<serde_json::Value>(
            "sendChatAction",
            json!({ "chat_id": chat_id, "action": action }),
        )
        .await
        .map(|_| ())
    }

    pub async fn send_voice(
        &self,
        chat_id: i64,
        audio: &[u8],
        caption: Option<&str>,
    ) -> Result<(), ApiError> {
        self.post_file("sendVoice", chat_id, "voice", "voice.ogg", audio, caption)
            .await
    }

    pub async fn send_audio(
        &self,
        chat_id: i64,
        audio: &[u8],
        caption: Option<&str>,
    ) -> Result<(), ApiError> {
        self.post_file("sendAudio", chat_id, "audio", "audio.ogg", audio, caption)
            .await
    }

    pub async fn send_photo(
        &self,
        chat_id: i64,
        image: &[u8],
        caption: Option<&str>,
    ) -> Result<(), ApiError> {
        self.post_file("sendPhoto", chat_id, "photo", "photo.jpg", image, caption)
            .await
    }

    pub async fn send_document(
        &self,
        chat_id: i64,
        data: &[u8],
        filename: &str,
        caption: Option<&str>,
    ) -> Result<(), ApiError> {
        self.post_file("sendDocument", chat_id, "document", filename, data, caption)
            .await
    }

    /// Resolve a file id and download its content (voice notes).
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, ApiError> {
        let file: File = self
            .post_json("getFile", json!({ "file_id": file_id }))
            .await?;
        let path = file
            .file_path
            .ok_or_else(|| ApiError::Api {
                description: "getFile returned no file_path".to_string(),
            })?;
        let url = format!("{}/{}", self.file_base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ApiError::Api {
                description: format!("file download failed: HTTP {}", response.status()),
            });
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ApiError::Transport(e.to_string()))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, ApiError> {
        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        decode_envelope(response).await
    }

    async fn post_file(
        &self,
        method: &str,
        chat_id: i64,
        field: &str,
        filename: &str,
        data: &[u8],
        caption: Option<&str>,
    ) -> Result<(), ApiError> {
        let url = format!("{}/{}", self.base_url, method);
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(
                field.to_string(),
                reqwest::multipart::Part::bytes(data.to_vec())
                    .file_name(filename.to_string()),
            );
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        decode_envelope::<serde_json::Value>(response).await.map(|_| ())
    }
}

/// Decode a Bot API response envelope, mapping 429s to `RateLimited` with
/// the server's hint (body `parameters.retry_after`, else the Retry-After
/// header, else 1 s).
async fn decode_envelope<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let status = response.status();
    let header_hint = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let envelope: ApiEnvelope<T> = response
        .json()
        .await
        .map_err(|e| ApiError::Transport(e.to_string()))?;

    if envelope.ok {
        return envelope.result.ok_or_else(|| ApiError::Api {
            description: "ok response without result".to_string(),
        });
    }

    if status.as_u16() == 429 {
        let retry_after_secs = envelope
            .parameters
            .and_then(|p| p.retry_after)
            .or(header_hint)
            .unwrap_or(1);
        return Err(ApiError::RateLimited { retry_after_secs });
    }

    Err(ApiError::Api {
        description: envelope
            .description
            .unwrap_or_else(|| format!("HTTP {status}")),
    })
}

/// Run `op` with rate-limit retries: sleep the server's hint (capped at
/// [`RETRY_AFTER_CAP_SECS`]) between attempts, up to [`MAX_SEND_ATTEMPTS`]
/// total. Any other error surfaces immediately.
pub async fn with_rate_limit_retry<T, F, Fut>(mut op: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(ApiError::RateLimited { retry_after_secs }) if attempt < MAX_SEND_ATTEMPTS => {
                let sleep_secs = retry_after_secs.min(RETRY_AFTER_CAP_SECS);
                warn!(attempt, sleep_secs, "telegram rate limited, backing off");
                tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(attempt, error = %e, "telegram call failed");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retry_sleeps_server_hint_then_succeeds() {
        // Scenario: first attempt 429 with retry_after=2, second succeeds.
        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result = with_rate_limit_retry(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Err(ApiError::RateLimited {
                        retry_after_secs: 2,
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 2, "second attempt succeeds");
        assert_eq!(attempts.load(Ordering::SeqCst), 2, "total attempts = 2");
        assert_eq!(
            started.elapsed(),
            Duration::from_secs(2),
            "slept exactly the server hint"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_three_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_rate_limit_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ApiError::RateLimited {
                    retry_after_secs: 1,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(ApiError::RateLimited { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_hint_is_capped_at_thirty_seconds() {
        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let _ = with_rate_limit_retry(|| {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Err(ApiError::RateLimited {
                        retry_after_secs: 600,
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn non_rate_limit_errors_surface_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_rate_limit_retry(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ApiError::Api {
                    description: "Bad Request".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(ApiError::Api { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn parse_error_detection() {
        let err = ApiError::Api {
            description: "Bad Request: can't parse entities".to_string(),
        };
        assert!(err.is_parse_error());
        assert!(!err.is_voice_forbidden());
    }

    #[test]
    fn voice_forbidden_detection() {
        let err = ApiError::Api {
            description: "Forbidden: VOICE_MESSAGES_FORBIDDEN".to_string(),
        };
        assert!(err.is_voice_forbidden());
    }
}

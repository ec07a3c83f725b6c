use std::time::Duration;

use reqwest::{Client, StatusCode};

use super::error::GenerateError;
use super::types::{Message, MessagesRequest, MessagesResponse};
use super::{Generator, render_prompt};
use crate::job::Payload;

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_RETRY_AFTER_MS: u64 = 1000;

/// Settings for the HTTP generator, usually taken from [`BatchConfig`](crate::config::BatchConfig).
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_key: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    /// Ceiling on a server `retry-after` hint.
    pub max_retry_after: Duration,
}

impl ClientSettings {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: API_URL.to_string(),
            max_tokens: 200,
            request_timeout: Duration::from_secs(60),
            max_retry_after: Duration::from_secs(60),
        }
    }
}

/// Messages API client used as the external generation capability.
pub struct AnthropicClient {
    settings: ClientSettings,
    client: Client,
}

impl AnthropicClient {
    pub fn new(settings: ClientSettings) -> Result<Self, GenerateError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self { settings, client })
    }

    async fn send_message(&self, req: &MessagesRequest) -> Result<MessagesResponse, GenerateError> {
        let response = self
            .client
            .post(&self.settings.base_url)
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(|v| self.retry_after_ms(v))
                .unwrap_or(DEFAULT_RETRY_AFTER_MS);
            let body = response.text().await.unwrap_or_default();
            if is_daily_limit(&body) {
                return Err(GenerateError::QuotaExhausted(body));
            }
            return Err(GenerateError::RateLimited { retry_after_ms });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(GenerateError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<MessagesResponse>().await?;
        Ok(body)
    }

    /// Milliseconds to wait for a `retry-after` value in seconds, capped at
    /// `max_retry_after`. Unparseable values get the default wait.
    fn retry_after_ms(&self, header: &str) -> u64 {
        let cap = u64::try_from(self.settings.max_retry_after.as_millis()).unwrap_or(u64::MAX);
        header
            .trim()
            .parse::<u64>()
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(DEFAULT_RETRY_AFTER_MS)
            .min(cap)
    }
}

impl Generator for AnthropicClient {
    async fn generate(&self, payload: &Payload, instruction: &str, model: &str) -> Result<String, GenerateError> {
        let req = MessagesRequest {
            model: model.to_string(),
            max_tokens: self.settings.max_tokens,
            system: None,
            temperature: Some(0.8),
            messages: vec![Message::user(render_prompt(instruction, payload))],
        };
        let response = self.send_message(&req).await?;
        response
            .text()
            .ok_or_else(|| GenerateError::InvalidResponse("response contained no text".into()))
    }
}

/// A 429 whose body talks about a per-day limit will not clear on retry.
fn is_daily_limit(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("per day") || lower.contains("daily")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> AnthropicClient {
        let mut settings = ClientSettings::new("sk-test".into());
        settings.base_url = server.uri();
        settings.max_retry_after = Duration::from_secs(30);
        AnthropicClient::new(settings).unwrap()
    }

    const NOTE: &str = "Write a short note.";

    fn payload() -> Payload {
        let mut p = Payload::new();
        p.insert("first_name".into(), json!("Ada"));
        p
    }

    #[tokio::test]
    async fn generate_returns_trimmed_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "content": [{"type": "text", "text": " Hey Ada \n"}],
                "model": "m",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1, "output_tokens": 2}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let text = client.generate(&payload(), NOTE, "m").await.unwrap();
        assert_eq!(text, "Hey Ada");
    }

    #[tokio::test]
    async fn plain_429_is_transient_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "2")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let err = client_for(&server).await.generate(&payload(), NOTE, "m").await.unwrap_err();
        assert!(matches!(err, GenerateError::RateLimited { retry_after_ms: 2000 }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn daily_limit_429_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Limit reached: requests per day"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.generate(&payload(), NOTE, "m").await.unwrap_err();
        assert!(matches!(err, GenerateError::QuotaExhausted(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_error_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.generate(&payload(), NOTE, "m").await.unwrap_err();
        match err {
            GenerateError::ApiError { status, ref message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_content_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_2",
                "content": [],
                "model": "m",
                "stop_reason": null
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).await.generate(&payload(), NOTE, "m").await.unwrap_err();
        assert!(matches!(err, GenerateError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn huge_retry_after_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "18446744073709551615"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.generate(&payload(), NOTE, "m").await.unwrap_err();
        assert!(matches!(err, GenerateError::RateLimited { retry_after_ms: 30_000 }));
    }

    #[tokio::test]
    async fn prompt_carries_the_step_instruction() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("Write a follow-up."))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_3",
                "content": [{"type": "text", "text": "Following up"}],
                "model": "m",
                "stop_reason": "end_turn"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let text = client.generate(&payload(), "Write a follow-up.", "m").await.unwrap();
        assert_eq!(text, "Following up");
    }

    #[test]
    fn retry_after_parsing() {
        let client = AnthropicClient::new(ClientSettings::new("k".into())).unwrap();
        assert_eq!(client.retry_after_ms("2"), 2000);
        assert_eq!(client.retry_after_ms(" 5 "), 5000);
        assert_eq!(client.retry_after_ms("soon"), DEFAULT_RETRY_AFTER_MS);
        assert_eq!(client.retry_after_ms("99999999999999999"), 60_000);
    }

    #[test]
    fn daily_limit_detection() {
        assert!(is_daily_limit("Rate limit reached for requests per day (RPD)"));
        assert!(is_daily_limit("DAILY quota exceeded"));
        assert!(!is_daily_limit("Too many requests per minute"));
    }
}

//! Relay Completion Providers
//!
//! OpenAI-compatible and Gemini-style completion backends behind one
//! `CompletionService` trait, with a single error taxonomy for every outcome
//! the conversation handler has to explain to the user.

use anyhow::anyhow;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "Respond as a concise, knowledgeable assistant.";

const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const GEMINI_DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// One finished exchange: the user's question and the answer it got.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

impl Turn {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("completion service rate limited the request")]
    RateLimited,
    #[error("completion service rejected the credentials")]
    Unauthorized,
    #[error("completion response had no usable candidate: {0}")]
    MalformedResponse(String),
    #[error("completion service HTTP {status}: {body}")]
    ServiceError { status: u16, body: String },
    #[error("completion transport failure: {0}")]
    Transport(String),
}

impl CompletionError {
    pub fn user_message(&self) -> &'static str {
        match self {
            CompletionError::RateLimited => {
                "⏳ Слишком много запросов. Подождите немного и попробуйте снова."
            }
            CompletionError::Unauthorized => {
                "🔒 Сервис ответов отклонил ключ доступа. Сообщите администратору бота."
            }
            CompletionError::MalformedResponse(_) => {
                "🤷 Модель не вернула ответ. Попробуйте выбрать другую модель: /model"
            }
            CompletionError::ServiceError { .. } => {
                "⚠️ Сервис ответов вернул ошибку. Попробуйте позже."
            }
            CompletionError::Transport(_) => {
                "📡 Не удалось связаться с сервисом ответов. Попробуйте позже."
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CompletionError::RateLimited => "rate_limited",
            CompletionError::Unauthorized => "unauthorized",
            CompletionError::MalformedResponse(_) => "malformed_response",
            CompletionError::ServiceError { .. } => "service_error",
            CompletionError::Transport(_) => "transport",
        }
    }
}

#[async_trait::async_trait]
pub trait CompletionService: Send + Sync {
    fn name(&self) -> &str;

    /// Sends the system instruction, `prior` turns oldest first, then `prompt`.
    /// Never retries; history bookkeeping is the caller's job.
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        prior: &[Turn],
    ) -> Result<String, CompletionError>;
}

fn build_client(timeout: Duration) -> anyhow::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| anyhow!("failed to build completion HTTP client: {}", e))
}

fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

fn classify_status(status: StatusCode, body: &str) -> CompletionError {
    match status.as_u16() {
        429 => CompletionError::RateLimited,
        401 | 403 => CompletionError::Unauthorized,
        code => CompletionError::ServiceError {
            status: code,
            body: truncate_for_error(body, 600),
        },
    }
}

/// Sends the request and returns the decoded JSON body of a successful reply.
async fn execute(request: RequestBuilder) -> Result<serde_json::Value, CompletionError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            CompletionError::Transport(format!("request timed out: {}", e))
        } else {
            CompletionError::Transport(e.to_string())
        }
    })?;

    let status = response.status();
    let raw_body = response
        .text()
        .await
        .map_err(|e| CompletionError::Transport(format!("failed to read body: {}", e)))?;

    if !status.is_success() {
        return Err(classify_status(status, &raw_body));
    }

    serde_json::from_str(&raw_body).map_err(|e| {
        CompletionError::MalformedResponse(format!(
            "decode failed: {} | body={}",
            e,
            truncate_for_error(&raw_body, 600)
        ))
    })
}

pub struct OpenAICompatibleCompletion {
    client: Client,
    api_key: String,
    base_url: String,
    system_prompt: String,
}

impl OpenAICompatibleCompletion {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        timeout: Duration,
        system_prompt: Option<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| OPENAI_DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            system_prompt: system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_messages(&self, prompt: &str, prior: &[Turn]) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(prior.len() * 2 + 2);
        messages.push(serde_json::json!({ "role": "system", "content": self.system_prompt }));
        for turn in prior {
            messages.push(serde_json::json!({ "role": "user", "content": turn.question }));
            messages.push(serde_json::json!({ "role": "assistant", "content": turn.answer }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));
        messages
    }

    fn parse_response(response: &serde_json::Value) -> Result<String, CompletionError> {
        if let Some(error) = response.get("error") {
            return Err(CompletionError::MalformedResponse(format!(
                "API error: {}",
                error
            )));
        }

        let choices = response
            .get("choices")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                CompletionError::MalformedResponse(
                    "Missing 'choices' array in provider response".to_string(),
                )
            })?;

        let choice = choices.first().ok_or_else(|| {
            CompletionError::MalformedResponse(
                "Empty 'choices' array in provider response".to_string(),
            )
        })?;

        choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                CompletionError::MalformedResponse(
                    "Missing message content in provider response".to_string(),
                )
            })
    }
}

#[async_trait::async_trait]
impl CompletionService for OpenAICompatibleCompletion {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        prior: &[Turn],
    ) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": model,
            "messages": self.build_messages(prompt, prior),
        });

        tracing::debug!(model = %model, turns = prior.len(), "Sending completion request");

        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body);
        let response = execute(request).await?;
        Self::parse_response(&response)
    }
}

/// Google Generative Language `generateContent` backend.
pub struct GeminiCompletion {
    client: Client,
    api_key: String,
    base_url: String,
    system_prompt: String,
}

impl GeminiCompletion {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        timeout: Duration,
        system_prompt: Option<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| GEMINI_DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            system_prompt: system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string()),
        })
    }

    fn build_body(&self, prompt: &str, prior: &[Turn]) -> serde_json::Value {
        let mut contents = Vec::with_capacity(prior.len() * 2 + 1);
        for turn in prior {
            contents.push(serde_json::json!({ "role": "user", "parts": [{ "text": turn.question }] }));
            contents.push(serde_json::json!({ "role": "model", "parts": [{ "text": turn.answer }] }));
        }
        contents.push(serde_json::json!({ "role": "user", "parts": [{ "text": prompt }] }));

        serde_json::json!({
            "systemInstruction": { "parts": [{ "text": self.system_prompt }] },
            "contents": contents,
        })
    }

    fn parse_response(response: &serde_json::Value) -> Result<String, CompletionError> {
        let candidates = response
            .get("candidates")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                let reason = response
                    .get("promptFeedback")
                    .and_then(|f| f.get("blockReason"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("no candidates");
                CompletionError::MalformedResponse(format!(
                    "Missing 'candidates' array in provider response ({})",
                    reason
                ))
            })?;

        let candidate = candidates.first().ok_or_else(|| {
            CompletionError::MalformedResponse(
                "Empty 'candidates' array in provider response".to_string(),
            )
        })?;

        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .ok_or_else(|| {
                CompletionError::MalformedResponse(
                    "Missing content parts in provider response".to_string(),
                )
            })?;

        let text = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(CompletionError::MalformedResponse(
                "Candidate carried no text".to_string(),
            ));
        }
        Ok(text)
    }
}

#[async_trait::async_trait]
impl CompletionService for GeminiCompletion {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        prior: &[Turn],
    ) -> Result<String, CompletionError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);

        tracing::debug!(model = %model, turns = prior.len(), "Sending completion request");

        let request = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.build_body(prompt, prior));
        let response = execute(request).await?;
        Self::parse_response(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gemini(server: &MockServer) -> GeminiCompletion {
        GeminiCompletion::new(
            "key".to_string(),
            Some(server.uri()),
            Duration::from_secs(5),
            None,
        )
        .expect("client")
    }

    fn openai(server: &MockServer) -> OpenAICompatibleCompletion {
        OpenAICompatibleCompletion::new(
            "key".to_string(),
            Some(server.uri()),
            Duration::from_secs(5),
            None,
        )
        .expect("client")
    }

    async fn mount_gemini(server: &MockServer, template: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .respond_with(template)
            .mount(server)
            .await;
    }

    #[test]
    fn classify_status_maps_known_codes() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            CompletionError::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            CompletionError::Unauthorized
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, ""),
            CompletionError::Unauthorized
        );
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "upstream"),
            CompletionError::ServiceError { status: 502, .. }
        ));
    }

    #[test]
    fn every_error_kind_has_a_distinct_message() {
        let errors = [
            CompletionError::RateLimited,
            CompletionError::Unauthorized,
            CompletionError::MalformedResponse(String::new()),
            CompletionError::ServiceError {
                status: 500,
                body: String::new(),
            },
            CompletionError::Transport(String::new()),
        ];
        let mut messages: Vec<_> = errors.iter().map(|e| e.user_message()).collect();
        messages.sort();
        messages.dedup();
        assert_eq!(messages.len(), errors.len());
    }

    #[test]
    fn openai_messages_interleave_prior_turns() {
        let provider = OpenAICompatibleCompletion::new(
            "key".to_string(),
            None,
            Duration::from_secs(5),
            None,
        )
        .expect("client");
        let prior = vec![Turn::new("q1", "a1"), Turn::new("q2", "a2")];
        let messages = provider.build_messages("q3", &prior);
        let roles: Vec<_> = messages
            .iter()
            .map(|m| m["role"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(
            roles,
            vec!["system", "user", "assistant", "user", "assistant", "user"]
        );
        assert_eq!(messages[5]["content"], "q3");
        assert_eq!(provider.base_url(), "https://api.openai.com/v1");
    }

    #[tokio::test]
    async fn gemini_returns_first_candidate_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .and(header("x-goog-api-key", "key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [
                    { "content": { "role": "model", "parts": [{ "text": "Paris" }] } }
                ]
            })))
            .mount(&server)
            .await;

        let answer = gemini(&server)
            .complete("capital of France?", "gemini-1.5-flash", &[])
            .await
            .expect("answer");
        assert_eq!(answer, "Paris");
    }

    #[tokio::test]
    async fn gemini_429_is_rate_limited() {
        let server = MockServer::start().await;
        mount_gemini(&server, ResponseTemplate::new(429).set_body_string("quota")).await;

        let err = gemini(&server)
            .complete("hi", "gemini-1.5-flash", &[])
            .await
            .expect_err("rate limited");
        assert_eq!(err, CompletionError::RateLimited);
    }

    #[tokio::test]
    async fn gemini_401_is_unauthorized() {
        let server = MockServer::start().await;
        mount_gemini(&server, ResponseTemplate::new(401).set_body_string("bad key")).await;

        let err = gemini(&server)
            .complete("hi", "gemini-1.5-flash", &[])
            .await
            .expect_err("unauthorized");
        assert_eq!(err, CompletionError::Unauthorized);
    }

    #[tokio::test]
    async fn gemini_missing_candidates_is_malformed() {
        let server = MockServer::start().await;
        mount_gemini(
            &server,
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "promptFeedback": { "blockReason": "SAFETY" }
            })),
        )
        .await;

        let err = gemini(&server)
            .complete("hi", "gemini-1.5-flash", &[])
            .await
            .expect_err("malformed");
        assert!(matches!(err, CompletionError::MalformedResponse(ref d) if d.contains("SAFETY")));
    }

    #[tokio::test]
    async fn gemini_other_status_keeps_body() {
        let server = MockServer::start().await;
        mount_gemini(&server, ResponseTemplate::new(503).set_body_string("overloaded")).await;

        let err = gemini(&server)
            .complete("hi", "gemini-1.5-flash", &[])
            .await
            .expect_err("service error");
        assert_eq!(
            err,
            CompletionError::ServiceError {
                status: 503,
                body: "overloaded".to_string()
            }
        );
    }

    #[tokio::test]
    async fn openai_reads_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "choices": [{ "message": { "role": "assistant", "content": "hello" } }]
            })))
            .mount(&server)
            .await;

        let answer = openai(&server)
            .complete("hi", "gpt-4o-mini", &[Turn::new("a", "b")])
            .await
            .expect("answer");
        assert_eq!(answer, "hello");
    }

    #[tokio::test]
    async fn openai_missing_choices_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "id": "x" })))
            .mount(&server)
            .await;

        let err = openai(&server)
            .complete("hi", "gpt-4o-mini", &[])
            .await
            .expect_err("malformed");
        assert!(matches!(err, CompletionError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let provider = OpenAICompatibleCompletion::new(
            "key".to_string(),
            Some("http://127.0.0.1:1".to_string()),
            Duration::from_secs(2),
            None,
        )
        .expect("client");

        let err = provider
            .complete("hi", "gpt-4o-mini", &[])
            .await
            .expect_err("transport");
        assert!(matches!(err, CompletionError::Transport(_)));
    }
}

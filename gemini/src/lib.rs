//! Minimal Google Gemini API client.
//!
//! This crate provides a focused client for Gemini's generateContent API with:
//! - Free-text and JSON-mode (schema-constrained) completions
//! - Text embeddings via embedContent
//! - API key rotation across a pool of keys
//! - Bounded retry with exponential backoff for transient failures

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_EMBED_MODEL: &str = "text-embedding-004";

/// Maximum retry attempts for retryable failures.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff.
const BACKOFF_BASE_MS: u64 = 500;

/// Errors that can occur when using the Gemini client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("API key not configured")]
    NoApiKey,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Response blocked by safety filter: {0}")]
    SafetyBlocked(String),

    #[error("Model returned an empty response")]
    Empty,

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Quota exhausted across all configured keys")]
    QuotaExhausted,
}

impl Error {
    /// Whether this failure is worth retrying at the client boundary.
    ///
    /// Rate limits, server errors, network hiccups, empty candidates, and
    /// transient parse failures of the model's own output are retryable.
    /// Safety blocks and exhausted quota are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Empty | Error::Parse(_) => true,
            Error::Api { status, .. } => *status == 429 || *status >= 500,
            Error::NoApiKey | Error::SafetyBlocked(_) | Error::QuotaExhausted => false,
        }
    }
}

/// Gemini API client.
///
/// Owns its key-rotation state explicitly; callers pass the handle into
/// whatever needs it rather than reaching for a global.
#[derive(Clone)]
pub struct Gemini {
    client: reqwest::Client,
    keys: Arc<Vec<String>>,
    key_cursor: Arc<AtomicUsize>,
    model: String,
    embed_model: String,
}

impl Gemini {
    /// Create a new client with a single API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_keys(vec![api_key.into()])
    }

    /// Create a client with a pool of keys to rotate through on rate limits.
    pub fn with_keys(keys: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .connect_timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            keys: Arc::new(keys),
            key_cursor: Arc::new(AtomicUsize::new(0)),
            model: DEFAULT_MODEL.to_string(),
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
        }
    }

    /// Create a client from `GEMINI_API_KEYS` (comma-separated) or
    /// `GEMINI_API_KEY` environment variables.
    pub fn from_env() -> Result<Self, Error> {
        if let Ok(pool) = std::env::var("GEMINI_API_KEYS") {
            let keys: Vec<String> = pool
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            if !keys.is_empty() {
                return Ok(Self::with_keys(keys));
            }
        }
        let key = std::env::var("GEMINI_API_KEY").map_err(|_| Error::NoApiKey)?;
        Ok(Self::new(key))
    }

    /// Set the default generation model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the embedding model.
    pub fn with_embed_model(mut self, model: impl Into<String>) -> Self {
        self.embed_model = model.into();
        self
    }

    fn current_key(&self) -> Result<&str, Error> {
        if self.keys.is_empty() {
            return Err(Error::NoApiKey);
        }
        let idx = self.key_cursor.load(Ordering::Relaxed) % self.keys.len();
        Ok(&self.keys[idx])
    }

    /// Advance to the next key in the pool. Returns false once every key has
    /// been rotated through for the current request.
    fn rotate_key(&self, rotations: &mut usize) -> bool {
        if self.keys.len() <= 1 {
            return false;
        }
        self.key_cursor.fetch_add(1, Ordering::Relaxed);
        *rotations += 1;
        *rotations < self.keys.len()
    }

    /// Send a generation request and return the full text response.
    ///
    /// Retryable failures are retried up to a fixed bound with exponential
    /// backoff; a 429 rotates the key pool before retrying. Safety blocks
    /// and exhausted quota surface immediately.
    pub async fn generate(&self, request: Request) -> Result<Response, Error> {
        let api_request = self.build_api_request(&request, None);
        self.generate_with_retry(&api_request, request.model.as_deref())
            .await
    }

    /// Send a JSON-mode request constrained by `schema` and parse the result.
    ///
    /// Markdown code fences around the JSON are stripped before parsing.
    pub async fn generate_json(
        &self,
        request: Request,
        schema: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        let api_request = self.build_api_request(&request, Some(schema));
        let response = self
            .generate_with_retry(&api_request, request.model.as_deref())
            .await?;
        let json_str = extract_json(&response.text);
        serde_json::from_str(json_str).map_err(|e| Error::Parse(format!("{e}: {json_str}")))
    }

    /// Compute an embedding vector for the given text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, Error> {
        let body = EmbedRequest {
            model: format!("models/{}", self.embed_model),
            content: ApiContent {
                role: None,
                parts: vec![ApiPart {
                    text: text.to_string(),
                }],
            },
        };

        let key = self.current_key()?.to_string();
        let url = format!("{API_BASE}/models/{}:embedContent", self.embed_model);
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, message });
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        if parsed.embedding.values.is_empty() {
            return Err(Error::Empty);
        }
        Ok(parsed.embedding.values)
    }

    async fn generate_with_retry(
        &self,
        api_request: &ApiRequest,
        model_override: Option<&str>,
    ) -> Result<Response, Error> {
        let model = model_override.unwrap_or(&self.model);
        let mut rotations = 0usize;
        let mut last_err = Error::Empty;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let jitter: u64 = rand::Rng::gen_range(&mut rand::thread_rng(), 0..250);
                let delay = BACKOFF_BASE_MS * 2u64.pow(attempt - 1) + jitter;
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            match self.generate_once(api_request, model).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() => {
                    if let Error::Api { status: 429, .. } = e {
                        // Rate limited: try the next key in the pool. If the
                        // whole pool is rate limited, the quota is gone.
                        if !self.rotate_key(&mut rotations) && self.keys.len() > 1 {
                            return Err(Error::QuotaExhausted);
                        }
                    }
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err)
    }

    async fn generate_once(&self, api_request: &ApiRequest, model: &str) -> Result<Response, Error> {
        let key = self.current_key()?.to_string();
        let url = format!("{API_BASE}/models/{model}:generateContent");

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &key)
            .json(api_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, message });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        parse_response(api_response)
    }

    fn build_api_request(
        &self,
        request: &Request,
        response_schema: Option<serde_json::Value>,
    ) -> ApiRequest {
        let contents = request
            .messages
            .iter()
            .map(|m| ApiContent {
                role: Some(
                    match m.role {
                        Role::User => "user",
                        Role::Model => "model",
                    }
                    .to_string(),
                ),
                parts: vec![ApiPart {
                    text: m.text.clone(),
                }],
            })
            .collect();

        let thinking_config = request
            .thinking_budget
            .map(|budget| ThinkingConfig { thinking_budget: budget });

        let generation_config = GenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_output_tokens,
            response_mime_type: response_schema
                .as_ref()
                .map(|_| "application/json".to_string()),
            response_schema,
            thinking_config,
        };

        ApiRequest {
            contents,
            system_instruction: request.system.as_ref().map(|text| ApiContent {
                role: None,
                parts: vec![ApiPart { text: text.clone() }],
            }),
            generation_config,
        }
    }
}

fn parse_response(api_response: ApiResponse) -> Result<Response, Error> {
    if let Some(feedback) = api_response.prompt_feedback {
        if let Some(reason) = feedback.block_reason {
            return Err(Error::SafetyBlocked(reason));
        }
    }

    let candidate = api_response
        .candidates
        .into_iter()
        .next()
        .ok_or(Error::Empty)?;

    if let Some(ref reason) = candidate.finish_reason {
        if reason == "SAFETY" || reason == "PROHIBITED_CONTENT" {
            return Err(Error::SafetyBlocked(reason.clone()));
        }
    }

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().map(|p| p.text).collect::<Vec<_>>())
        .unwrap_or_default()
        .join("");

    if text.trim().is_empty() {
        return Err(Error::Empty);
    }

    Ok(Response {
        text,
        finish_reason: candidate.finish_reason,
    })
}

/// Extract JSON from a response that might have markdown code blocks.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // Handle ```json ... ``` blocks
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Handle ``` ... ``` blocks (without json specifier)
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    text
}

// ============================================================================
// Public types
// ============================================================================

/// A generation request.
#[derive(Debug, Clone)]
pub struct Request {
    pub model: Option<String>,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<usize>,
    pub thinking_budget: Option<i32>,
}

impl Request {
    /// Create a new request with the given messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            system: None,
            messages,
            temperature: None,
            max_output_tokens: None,
            thinking_budget: None,
        }
    }

    /// Shorthand for a single-user-turn request.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(vec![Message::user(text)])
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: usize) -> Self {
        self.max_output_tokens = Some(tokens);
        self
    }

    /// Token budget the model may spend thinking before answering.
    /// Zero disables thinking entirely.
    pub fn with_thinking_budget(mut self, budget: i32) -> Self {
        self.thinking_budget = Some(budget);
        self
    }
}

/// A message in the conversation.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    /// Create a model message.
    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

/// A completed generation.
#[derive(Debug, Clone)]
pub struct Response {
    /// Concatenated candidate text.
    pub text: String,

    /// Finish reason reported by the API, if any.
    pub finish_reason: Option<String>,
}

// ============================================================================
// Internal API types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest {
    contents: Vec<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiContent>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<ApiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiCandidate {
    content: Option<ApiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: ApiContent,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Debug, Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = Gemini::new("test-key");
        assert_eq!(client.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_client_with_model() {
        let client = Gemini::new("test-key").with_model("gemini-2.5-pro");
        assert_eq!(client.model, "gemini-2.5-pro");
    }

    #[test]
    fn test_request_builder() {
        let request = Request::user("Hello")
            .with_system("You are a storyteller")
            .with_max_output_tokens(1000)
            .with_temperature(0.7)
            .with_thinking_budget(0);

        assert_eq!(request.max_output_tokens, Some(1000));
        assert!(request.system.is_some());
        assert_eq!(request.temperature, Some(0.7));
        assert_eq!(request.thinking_budget, Some(0));
    }

    #[test]
    fn test_key_rotation_wraps() {
        let client = Gemini::with_keys(vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(client.current_key().unwrap(), "a");

        let mut rotations = 0;
        assert!(client.rotate_key(&mut rotations));
        assert_eq!(client.current_key().unwrap(), "b");
        assert!(client.rotate_key(&mut rotations));
        assert_eq!(client.current_key().unwrap(), "c");

        // Third rotation exhausts the pool for this request.
        assert!(!client.rotate_key(&mut rotations));
        assert_eq!(client.current_key().unwrap(), "a");
    }

    #[test]
    fn test_single_key_never_rotates() {
        let client = Gemini::new("only");
        let mut rotations = 0;
        assert!(!client.rotate_key(&mut rotations));
        assert_eq!(rotations, 0);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("reset".into()).is_retryable());
        assert!(Error::Empty.is_retryable());
        assert!(Error::Api { status: 429, message: String::new() }.is_retryable());
        assert!(Error::Api { status: 503, message: String::new() }.is_retryable());
        assert!(!Error::Api { status: 400, message: String::new() }.is_retryable());
        assert!(!Error::SafetyBlocked("SAFETY".into()).is_retryable());
        assert!(!Error::QuotaExhausted.is_retryable());
    }

    #[test]
    fn test_extract_json_plain() {
        let text = r#"{"relevant": []}"#;
        assert_eq!(extract_json(text), text);
    }

    #[test]
    fn test_extract_json_markdown() {
        let text = "```json\n{\"relevant\": [\"doc-1\"]}\n```";
        assert_eq!(extract_json(text), r#"{"relevant": ["doc-1"]}"#);
    }

    #[test]
    fn test_extract_json_markdown_no_specifier() {
        let text = "```\n{\"relevant\": []}\n```";
        assert_eq!(extract_json(text), r#"{"relevant": []}"#);
    }

    #[test]
    fn test_parse_response_safety_block() {
        let api = ApiResponse {
            candidates: vec![],
            prompt_feedback: Some(PromptFeedback {
                block_reason: Some("SAFETY".to_string()),
            }),
        };
        assert!(matches!(parse_response(api), Err(Error::SafetyBlocked(_))));
    }

    #[test]
    fn test_parse_response_empty_candidates() {
        let api = ApiResponse {
            candidates: vec![],
            prompt_feedback: None,
        };
        assert!(matches!(parse_response(api), Err(Error::Empty)));
    }

    #[test]
    fn test_parse_response_text() {
        let api = ApiResponse {
            candidates: vec![ApiCandidate {
                content: Some(ApiContent {
                    role: Some("model".to_string()),
                    parts: vec![ApiPart {
                        text: "The tavern is quiet.".to_string(),
                    }],
                }),
                finish_reason: Some("STOP".to_string()),
            }],
            prompt_feedback: None,
        };
        let response = parse_response(api).unwrap();
        assert_eq!(response.text, "The tavern is quiet.");
    }
}

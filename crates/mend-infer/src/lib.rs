use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mend_config::{
    AiConfig, DEFAULT_GEMINI_API_KEY_ENV, DEFAULT_GEMINI_MODEL, DEFAULT_LOCAL_ENDPOINT,
    DEFAULT_LOCAL_MODEL, InferenceProviderKind,
};
use mend_core::Secret;
use serde_json::{Value, json};
use thiserror::Error;

mod pricing;

pub use pricing::{ModelPrice, estimate_cost, estimate_tokens, price_for, response_cost};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const MOCK_MODEL: &str = "mock";

/// One completion call. Sampling parameters are already resolved from the
/// per-code policy table.
#[derive(Debug, Clone, PartialEq)]
pub struct FixRequest {
    pub system: String,
    pub prompt: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FixResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderOverrides {
    pub provider: Option<InferenceProviderKind>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
}

pub struct LoadedProvider {
    pub provider: Box<dyn FixProvider>,
    pub provider_name: String,
    pub model_name: String,
}

impl std::fmt::Debug for LoadedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedProvider")
            .field("provider_name", &self.provider_name)
            .field("model_name", &self.model_name)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum InferError {
    #[error("missing API key in {0}")]
    MissingApiKey(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("response decoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Scripted(String),
    #[error("failed to lock shared resource: {0}")]
    LockPoisoned(String),
}

#[async_trait]
pub trait FixProvider: Send + Sync {
    async fn complete(&self, request: &FixRequest) -> Result<FixResponse, InferError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    Text(String),
    Fail(String),
}

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<MockReply>,
    requests: Vec<FixRequest>,
}

/// Replays scripted replies in order, then answers with an empty text.
/// Clones share the same script and request log.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.push(MockReply::Text(text.into()));
        self
    }

    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push(MockReply::Fail(message.into()));
        self
    }

    pub fn push(&self, reply: MockReply) {
        if let Ok(mut state) = self.state.lock() {
            state.replies.push_back(reply);
        }
    }

    pub fn requests(&self) -> Vec<FixRequest> {
        self.state
            .lock()
            .map(|state| state.requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl FixProvider for MockProvider {
    async fn complete(&self, request: &FixRequest) -> Result<FixResponse, InferError> {
        let reply = {
            let mut state = self
                .state
                .lock()
                .map_err(|err| InferError::LockPoisoned(err.to_string()))?;
            state.requests.push(request.clone());
            state.replies.pop_front()
        };

        match reply {
            Some(MockReply::Fail(message)) => Err(InferError::Scripted(message)),
            Some(MockReply::Text(text)) => Ok(FixResponse {
                input_tokens: estimate_tokens(&request.system) + estimate_tokens(&request.prompt),
                output_tokens: estimate_tokens(&text),
                text,
            }),
            None => Ok(FixResponse::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: Secret,
    api_base: String,
}

impl GeminiProvider {
    pub fn from_env_key(api_key_env: &str) -> Result<Self, InferError> {
        let api_key = Secret::from_env(api_key_env)
            .ok_or_else(|| InferError::MissingApiKey(api_key_env.to_owned()))?;
        Ok(Self::new(api_key))
    }

    pub fn new(api_key: Secret) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            api_base: GEMINI_API_BASE.to_owned(),
        }
    }

    fn endpoint_url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base,
            model,
            self.api_key.expose()
        )
    }
}

#[async_trait]
impl FixProvider for GeminiProvider {
    async fn complete(&self, request: &FixRequest) -> Result<FixResponse, InferError> {
        let body = json!({
            "systemInstruction": { "parts": [{ "text": request.system }] },
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
            "generationConfig": {
                "temperature": request.temperature,
                "topP": request.top_p,
                "maxOutputTokens": request.max_tokens
            }
        });

        let response: Value = self
            .client
            .post(self.endpoint_url(&request.model))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let text = extract_gemini_text(&response)?;
        Ok(FixResponse {
            input_tokens: token_count(&response, "/usageMetadata/promptTokenCount")
                .unwrap_or_else(|| estimate_tokens(&request.system) + estimate_tokens(&request.prompt)),
            output_tokens: token_count(&response, "/usageMetadata/candidatesTokenCount")
                .unwrap_or_else(|| estimate_tokens(&text)),
            text,
        })
    }
}

/// Ollama-compatible `/api/chat` endpoint.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl LocalProvider {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: normalize_optional(endpoint)
                .unwrap_or_else(|| DEFAULT_LOCAL_ENDPOINT.to_owned()),
        }
    }
}

#[async_trait]
impl FixProvider for LocalProvider {
    async fn complete(&self, request: &FixRequest) -> Result<FixResponse, InferError> {
        let body = json!({
            "model": request.model,
            "stream": false,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt }
            ],
            "options": {
                "temperature": request.temperature,
                "top_p": request.top_p,
                "num_predict": request.max_tokens
            }
        });

        let response: Value = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let text = extract_local_text(&response)?;
        Ok(FixResponse {
            input_tokens: token_count(&response, "/prompt_eval_count")
                .unwrap_or_else(|| estimate_tokens(&request.prompt)),
            output_tokens: token_count(&response, "/eval_count")
                .unwrap_or_else(|| estimate_tokens(&text)),
            text,
        })
    }
}

/// Builds the provider named by config, with CLI overrides on top. `auto`
/// resolves to Gemini. Only `mock` and `local` load without an API key; a
/// missing key is an error so stage 3 never runs against an empty script.
pub fn load_provider(
    ai: &AiConfig,
    overrides: ProviderOverrides,
) -> Result<LoadedProvider, InferError> {
    let selected_provider = overrides.provider.unwrap_or(ai.provider);
    let selected_model = first_non_empty(overrides.model, ai.model.clone());
    let selected_endpoint = first_non_empty(overrides.endpoint, ai.endpoint.clone());
    let selected_api_key_env =
        first_non_empty(overrides.api_key_env, Some(ai.api_key_env.clone()))
            .unwrap_or_else(|| DEFAULT_GEMINI_API_KEY_ENV.to_owned());

    let loaded = match selected_provider {
        InferenceProviderKind::Mock => mock(),
        InferenceProviderKind::Auto | InferenceProviderKind::Gemini => gemini(
            GeminiProvider::from_env_key(&selected_api_key_env)?,
            selected_model,
        ),
        InferenceProviderKind::Local => LoadedProvider {
            provider: Box::new(LocalProvider::new(selected_endpoint)),
            provider_name: InferenceProviderKind::Local.as_str().to_owned(),
            model_name: selected_model.unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_owned()),
        },
    };

    tracing::debug!(
        provider = %loaded.provider_name,
        model = %loaded.model_name,
        "inference provider loaded"
    );
    Ok(loaded)
}

fn gemini(provider: GeminiProvider, model: Option<String>) -> LoadedProvider {
    LoadedProvider {
        provider: Box::new(provider),
        provider_name: InferenceProviderKind::Gemini.as_str().to_owned(),
        model_name: model.unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_owned()),
    }
}

fn mock() -> LoadedProvider {
    LoadedProvider {
        provider: Box::new(MockProvider::new()),
        provider_name: InferenceProviderKind::Mock.as_str().to_owned(),
        model_name: MOCK_MODEL.to_owned(),
    }
}

fn extract_gemini_text(response: &Value) -> Result<String, InferError> {
    let parts = response
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            InferError::InvalidResponse("missing candidates[0].content.parts".to_owned())
        })?;

    Ok(parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(""))
}

fn extract_local_text(response: &Value) -> Result<String, InferError> {
    let candidate_paths = [
        "/message/content",
        "/response",
        "/choices/0/message/content",
        "/choices/0/text",
    ];

    candidate_paths
        .iter()
        .find_map(|path| response.pointer(path).and_then(Value::as_str))
        .map(str::to_owned)
        .ok_or_else(|| {
            InferError::InvalidResponse("missing local model text in response body".to_owned())
        })
}

fn token_count(response: &Value, pointer: &str) -> Option<u64> {
    response.pointer(pointer).and_then(Value::as_u64)
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn first_non_empty(primary: Option<String>, fallback: Option<String>) -> Option<String> {
    normalize_optional(primary).or_else(|| normalize_optional(fallback))
}

use serde::{Deserialize, Serialize};

use super::{EndpointError, GenerateRequest, LlmClient};

/// Sampling temperature for every stage. Low: the stages want reproducible JSON.
const TEMPERATURE: f32 = 0.1;

/// Blocking client for OpenAI-compatible `/chat/completions` endpoints
/// (DeepSeek, Qwen compatible-mode, OpenAI, local gateways).
pub struct OpenAiCompatClient {
    client: reqwest::blocking::Client,
}

impl OpenAiCompatClient {
    pub fn new() -> Result<Self, EndpointError> {
        let client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| EndpointError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Request body for `/chat/completions`.
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

fn completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

fn chat_body<'a>(request: &'a GenerateRequest<'a>) -> ChatRequest<'a> {
    ChatRequest {
        model: request.endpoint.model_name(),
        messages: [
            ChatMessage {
                role: "system",
                content: request.system,
            },
            ChatMessage {
                role: "user",
                content: request.prompt,
            },
        ],
        temperature: TEMPERATURE,
        stream: false,
    }
}

fn first_content(response: ChatResponse) -> Result<String, EndpointError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| EndpointError::ResponseParsing("response has no message content".into()))
}

impl LlmClient for OpenAiCompatClient {
    fn generate(&self, request: &GenerateRequest<'_>) -> Result<String, EndpointError> {
        let endpoint = request.endpoint;
        let mut builder = self
            .client
            .post(completions_url(&endpoint.base_url))
            .timeout(request.timeout)
            .json(&chat_body(request));

        if let Some(var) = endpoint.api_key_env.as_deref() {
            match std::env::var(var) {
                Ok(key) if !key.is_empty() => builder = builder.bearer_auth(key),
                _ => tracing::warn!(endpoint = %endpoint.name, env = var, "API key variable not set"),
            }
        }

        let response = builder.send().map_err(|e| {
            if e.is_timeout() {
                EndpointError::Timeout {
                    secs: request.timeout.as_secs(),
                }
            } else if e.is_connect() {
                EndpointError::Connection(endpoint.base_url.clone())
            } else {
                EndpointError::Client(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EndpointError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().map_err(|e| {
            if e.is_timeout() {
                EndpointError::Timeout {
                    secs: request.timeout.as_secs(),
                }
            } else {
                EndpointError::ResponseParsing(e.to_string())
            }
        })?;

        first_content(parsed)
    }
}

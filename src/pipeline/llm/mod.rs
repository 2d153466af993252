pub mod mock;
pub mod openai;

pub use mock::*;
pub use openai::*;

use std::time::Duration;

use thiserror::Error;

use super::router::EndpointSpec;
use super::types::{CallUsage, Stage};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EndpointError {
    #[error("Endpoint unreachable at {0}")]
    Connection(String),

    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Endpoint returned error (status {status}): {body}")]
    Http { status: u16, body: String },

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl EndpointError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// One blocking generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub endpoint: &'a EndpointSpec,
    pub stage: Stage,
    pub system: &'a str,
    pub prompt: &'a str,
    pub timeout: Duration,
}

/// Text-generation capability (allows mocking).
pub trait LlmClient {
    fn generate(&self, request: &GenerateRequest<'_>) -> Result<String, EndpointError>;
}

/// Rough token count used for routing and cost estimates (about 2 chars per token).
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(2)).unwrap_or(u32::MAX)
}

pub fn estimate_usage(endpoint: &EndpointSpec, prompt: &str, completion: &str) -> CallUsage {
    let prompt_tokens = estimate_tokens(prompt);
    let completion_tokens = estimate_tokens(completion);
    let total = f64::from(prompt_tokens) + f64::from(completion_tokens);
    CallUsage {
        prompt_tokens,
        completion_tokens,
        estimated_cost_usd: total / 1000.0 * endpoint.cost_per_1k,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 2);
        assert_eq!(estimate_tokens("时钟失锁"), 2);
    }

    #[test]
    fn usage_cost_follows_endpoint_price() {
        let mut spec = EndpointSpec::new("x", "http://x/v1");
        spec.cost_per_1k = 2.0;
        let usage = estimate_usage(&spec, &"a".repeat(1000), &"b".repeat(1000));
        assert_eq!(usage.prompt_tokens, 500);
        assert_eq!(usage.completion_tokens, 500);
        assert!((usage.estimated_cost_usd - 2.0).abs() < 1e-9);
    }
}

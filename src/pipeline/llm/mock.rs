use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{EndpointError, GenerateRequest, LlmClient};
use crate::pipeline::types::Stage;

type Handler = Box<dyn Fn(&GenerateRequest<'_>) -> Result<String, EndpointError> + Send + Sync>;

enum Responder {
    Fixed(String),
    Script(Mutex<VecDeque<Result<String, EndpointError>>>),
    Handler(Handler),
}

/// A call seen by [`MockLlmClient`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub endpoint: String,
    pub stage: Stage,
    pub prompt: String,
}

/// Mock client for tests and offline runs: fixed response, a script of
/// results consumed in order, or a handler closure.
pub struct MockLlmClient {
    responder: Responder,
    delay: Option<Duration>,
    calls: AtomicUsize,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl MockLlmClient {
    pub fn new(response: &str) -> Self {
        Self::with_responder(Responder::Fixed(response.to_string()))
    }

    /// Results returned in order; once exhausted every call fails.
    pub fn scripted(script: Vec<Result<String, EndpointError>>) -> Self {
        Self::with_responder(Responder::Script(Mutex::new(script.into())))
    }

    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&GenerateRequest<'_>) -> Result<String, EndpointError> + Send + Sync + 'static,
    {
        Self::with_responder(Responder::Handler(Box::new(handler)))
    }

    /// Sleep before answering (simulates a slow endpoint).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, stage: Stage) -> usize {
        self.recorded().iter().filter(|c| c.stage == stage).count()
    }

    pub fn recorded(&self) -> Vec<RecordedCall> {
        self.recorded
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn with_responder(responder: Responder) -> Self {
        Self {
            responder,
            delay: None,
            calls: AtomicUsize::new(0),
            recorded: Mutex::new(Vec::new()),
        }
    }
}

impl LlmClient for MockLlmClient {
    fn generate(&self, request: &GenerateRequest<'_>) -> Result<String, EndpointError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.push(RecordedCall {
                endpoint: request.endpoint.name.clone(),
                stage: request.stage,
                prompt: request.prompt.to_string(),
            });
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        match &self.responder {
            Responder::Fixed(response) => Ok(response.clone()),
            Responder::Script(queue) => queue
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front())
                .unwrap_or_else(|| Err(EndpointError::Client("mock script exhausted".into()))),
            Responder::Handler(handler) => handler(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::router::EndpointSpec;

    fn request<'a>(endpoint: &'a EndpointSpec, stage: Stage) -> GenerateRequest<'a> {
        GenerateRequest {
            endpoint,
            stage,
            system: "sys",
            prompt: "prompt",
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn fixed_response_and_counter() {
        let endpoint = EndpointSpec::new("a", "http://a/v1");
        let client = MockLlmClient::new("test response");
        assert_eq!(client.generate(&request(&endpoint, Stage::Boss)).unwrap(), "test response");
        assert_eq!(client.calls(), 1);
        assert_eq!(client.calls_for(Stage::Boss), 1);
        assert_eq!(client.recorded()[0].endpoint, "a");
    }

    #[test]
    fn script_is_consumed_in_order() {
        let endpoint = EndpointSpec::new("a", "http://a/v1");
        let client = MockLlmClient::scripted(vec![
            Err(EndpointError::Timeout { secs: 1 }),
            Ok("second".into()),
        ]);
        assert!(client.generate(&request(&endpoint, Stage::Log)).unwrap_err().is_timeout());
        assert_eq!(client.generate(&request(&endpoint, Stage::Log)).unwrap(), "second");
        assert!(client.generate(&request(&endpoint, Stage::Log)).is_err());
    }

    #[test]
    fn handler_sees_stage() {
        let endpoint = EndpointSpec::new("a", "http://a/v1");
        let client = MockLlmClient::with_handler(|r| Ok(r.stage.to_string()));
        assert_eq!(client.generate(&request(&endpoint, Stage::Code)).unwrap(), "CODE");
    }
}

use crate::session::{Role, Turn};
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    },
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// A prompt for the text-generation service: a system instruction followed by
/// the conversation so far.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub messages: Vec<Turn>,
}

impl Prompt {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: Vec::new(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<Turn>) -> Self {
        self.messages = messages;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: Some(0.7),
            max_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// The ways a text-generation call can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("rate limited by the text-generation service: {0}")]
    RateLimited(String),
    #[error("transient text-generation failure: {0}")]
    Transient(String),
    #[error("authentication with the text-generation service failed: {0}")]
    AuthFailure(String),
    #[error("permission denied by the text-generation service: {0}")]
    PermissionDenied(String),
    #[error("invalid response from the text-generation service: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    /// Rate limits and transient failures are worth retrying; everything else
    /// is fatal for the turn.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::RateLimited(_) | GenerationError::Transient(_))
    }
}

/// A text-generation service: prompt in, completion out.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
    ) -> Result<Completion, GenerationError>;
}

/// Bounded exponential backoff for retryable generation failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// The delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Calls `generator`, retrying retryable failures per `policy`.
pub async fn complete_with_retry(
    generator: &dyn TextGenerator,
    prompt: &Prompt,
    options: &GenerationOptions,
    policy: &RetryPolicy,
) -> Result<Completion, GenerationError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match generator.complete(prompt, options).await {
            Ok(completion) => return Ok(completion),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(attempt, max_attempts, ?delay, error = %e, "Text generation failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// An implementation of `TextGenerator` for any OpenAI-compatible API.
pub struct OpenAICompatibleGenerator {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleGenerator {
    /// Creates a new generator for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The specific model identifier to use for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    fn build_messages(prompt: &Prompt) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(prompt.system.clone())
                .build()?
                .into(),
        ];
        for turn in &prompt.messages {
            match turn.role {
                Role::User => messages.push(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(turn.content.clone())
                        .build()?
                        .into(),
                ),
                Role::Assistant => messages.push(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(turn.content.clone())
                        .build()?
                        .into(),
                ),
            }
        }
        Ok(messages)
    }
}

/// Sorts an `OpenAIError` into the generation error taxonomy.
fn classify(err: OpenAIError) -> GenerationError {
    match err {
        OpenAIError::Reqwest(e) => {
            let message = e.to_string();
            match e.status().map(|s| s.as_u16()) {
                Some(429) => GenerationError::RateLimited(message),
                Some(401) => GenerationError::AuthFailure(message),
                Some(403) => GenerationError::PermissionDenied(message),
                Some(status) if status >= 500 => GenerationError::Transient(message),
                Some(_) => GenerationError::InvalidResponse(message),
                None => GenerationError::Transient(message),
            }
        }
        OpenAIError::ApiError(api) => {
            let kind = format!(
                "{} {}",
                api.r#type.as_deref().unwrap_or_default(),
                api.code.as_deref().unwrap_or_default()
            )
            .to_lowercase();
            if kind.contains("rate_limit") || kind.contains("quota") {
                GenerationError::RateLimited(api.message)
            } else if kind.contains("invalid_api_key") || kind.contains("authentication") {
                GenerationError::AuthFailure(api.message)
            } else if kind.contains("permission") || kind.contains("forbidden") {
                GenerationError::PermissionDenied(api.message)
            } else if kind.contains("server_error") || kind.contains("overloaded") {
                GenerationError::Transient(api.message)
            } else {
                GenerationError::InvalidResponse(api.message)
            }
        }
        other => GenerationError::InvalidResponse(other.to_string()),
    }
}

#[async_trait]
impl TextGenerator for OpenAICompatibleGenerator {
    async fn complete(
        &self,
        prompt: &Prompt,
        options: &GenerationOptions,
    ) -> Result<Completion, GenerationError> {
        let messages = Self::build_messages(prompt).map_err(classify)?;

        let mut request = CreateChatCompletionRequestArgs::default();
        request.model(&self.model).messages(messages);
        if let Some(temperature) = options.temperature {
            request.temperature(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            request.max_completion_tokens(max_tokens);
        }
        let request = request
            .build()
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        let response: CreateChatCompletionResponse =
            self.client.chat().create(request).await.map_err(classify)?;

        let text = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| {
                GenerationError::InvalidResponse("LLM response had no text content".to_string())
            })?;
        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(Completion { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    fn completion(text: &str) -> Completion {
        Completion {
            text: text.to_string(),
            usage: TokenUsage::default(),
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GenerationError::RateLimited("x".into()).is_retryable());
        assert!(GenerationError::Transient("x".into()).is_retryable());
        assert!(!GenerationError::AuthFailure("x".into()).is_retryable());
        assert!(!GenerationError::PermissionDenied("x".into()).is_retryable());
        assert!(!GenerationError::InvalidResponse("x".into()).is_retryable());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut mock = MockTextGenerator::new();
        mock.expect_complete().times(3).returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GenerationError::Transient("timeout".into()))
            } else {
                Ok(completion("hello"))
            }
        });

        let result = complete_with_retry(
            &mock,
            &Prompt::new("sys"),
            &GenerationOptions::default(),
            &fast_policy(3),
        )
        .await;
        assert_eq!(result.unwrap().text, "hello");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut mock = MockTextGenerator::new();
        mock.expect_complete()
            .times(2)
            .returning(|_, _| Err(GenerationError::RateLimited("slow down".into())));

        let result = complete_with_retry(
            &mock,
            &Prompt::new("sys"),
            &GenerationOptions::default(),
            &fast_policy(2),
        )
        .await;
        assert_eq!(result, Err(GenerationError::RateLimited("slow down".into())));
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let mut mock = MockTextGenerator::new();
        mock.expect_complete()
            .times(1)
            .returning(|_, _| Err(GenerationError::AuthFailure("bad key".into())));

        let result = complete_with_retry(
            &mock,
            &Prompt::new("sys"),
            &GenerationOptions::default(),
            &fast_policy(5),
        )
        .await;
        assert_eq!(result, Err(GenerationError::AuthFailure("bad key".into())));
    }
}

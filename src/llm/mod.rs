pub mod models;
pub mod providers;

use crate::config::LlmConfig;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    ConnectionError(String),
    #[error("LLM response error: {0}")]
    ResponseError(String),
    #[error("LLM configuration error: {0}")]
    ConfigError(String),
    #[error("LLM unavailable: {0}")]
    Unavailable(String),
}

/// A single chat turn: system instructions plus the user payload.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Text completion backend. Output is free text and may wrap SQL or JSON in prose.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError>;
}

#[derive(Clone)]
pub struct LlmManager {
    provider: Option<Arc<dyn LlmProvider>>,
    unavailable_reason: String,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let provider: Arc<dyn LlmProvider> = match config.backend.as_str() {
            "remote" => Arc::new(providers::remote::RemoteLlmProvider::new(config)?),
            "azure" => Arc::new(providers::remote::RemoteLlmProvider::azure(config)?),
            "ollama" => Arc::new(providers::ollama::OllamaProvider::new(config)?),
            "disabled" => return Ok(Self::unavailable("LLM backend disabled in configuration")),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )));
            }
        };

        Ok(Self::with_provider(provider))
    }

    pub fn with_provider(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider: Some(provider),
            unavailable_reason: String::new(),
        }
    }

    /// A manager whose every call fails with [`LlmError::Unavailable`].
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            provider: None,
            unavailable_reason: reason.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError> {
        let Some(provider) = &self.provider else {
            warn!("LLM call skipped: {}", self.unavailable_reason);
            return Err(LlmError::Unavailable(self.unavailable_reason.clone()));
        };

        debug!("LLM prompt (system): {}", prompt.system);
        debug!("LLM prompt (user): {}", prompt.user);
        let text = provider.complete(prompt).await?;
        debug!("LLM raw response: {}", text);
        Ok(text)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses in order and records every prompt it saw.
    pub struct ScriptedLlm {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        pub prompts: Mutex<Vec<Prompt>>,
    }

    impl ScriptedLlm {
        pub fn new(replies: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(|r| Ok(r.to_string())).collect()),
                prompts: Mutex::new(Vec::new()),
            })
        }

        pub fn call_count(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(prompt.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::ResponseError("script exhausted".to_string())))
        }
    }

    #[tokio::test]
    async fn unavailable_manager_never_reaches_a_provider() {
        let manager = LlmManager::unavailable("no key");
        let err = manager.complete(&Prompt::new("s", "u")).await.unwrap_err();
        assert!(matches!(err, LlmError::Unavailable(_)));
        assert!(!manager.is_available());
    }

    #[tokio::test]
    async fn disabled_backend_builds_unavailable_manager() {
        let config = crate::config::AppConfig::default().llm;
        let manager = LlmManager::new(&config).unwrap();
        assert!(!manager.is_available());
    }
}

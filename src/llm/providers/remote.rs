use crate::config::LlmConfig;
use crate::llm::{LlmError, LlmProvider, Prompt};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// How the key is presented to the endpoint.
enum AuthStyle {
    /// `Authorization: Bearer <key>` (OpenAI compatible gateways)
    Bearer,
    /// `api-key: <key>` (Azure OpenAI deployments)
    ApiKeyHeader,
}

pub struct RemoteLlmProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    auth: AuthStyle,
}

#[derive(Serialize)]
struct PromptRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

impl RemoteLlmProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_url = config.api_url.clone().ok_or_else(|| {
            LlmError::ConfigError("API URL is required for remote LLM provider".to_string())
        })?;

        Self::build(config, api_url, AuthStyle::Bearer)
    }

    /// Azure OpenAI: `api_url` is the resource endpoint, `model` the deployment name.
    pub fn azure(config: &LlmConfig) -> Result<Self, LlmError> {
        let endpoint = config.api_url.clone().ok_or_else(|| {
            LlmError::ConfigError("API URL is required for Azure OpenAI".to_string())
        })?;
        let api_version = config
            .api_version
            .clone()
            .unwrap_or_else(|| "2024-02-15-preview".to_string());

        let api_url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint.trim_end_matches('/'),
            config.model,
            api_version
        );

        Self::build(config, api_url, AuthStyle::ApiKeyHeader)
    }

    fn build(config: &LlmConfig, api_url: String, auth: AuthStyle) -> Result<Self, LlmError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            LlmError::ConfigError("API key is required for remote LLM provider".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            auth,
        })
    }
}

#[async_trait]
impl LlmProvider for RemoteLlmProvider {
    async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError> {
        let request = PromptRequest {
            // Azure routes by deployment in the URL, the body must not name a model
            model: match self.auth {
                AuthStyle::Bearer => Some(self.model.clone()),
                AuthStyle::ApiKeyHeader => None,
            },
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: prompt.system.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.user.clone(),
                },
            ],
            temperature: self.temperature,
            max_tokens: 2000,
        };

        info!("Sending chat completion request with model: {}", self.model);

        let builder = self.client.post(&self.api_url).json(&request);
        let builder = match self.auth {
            AuthStyle::Bearer => builder.header("Authorization", format!("Bearer {}", self.api_key)),
            AuthStyle::ApiKeyHeader => builder.header("api-key", &self.api_key),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| LlmError::ConnectionError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("LLM API responded with status code: {} - {}", status, body);
            return Err(LlmError::ResponseError(format!(
                "API responded with status code: {}",
                status
            )));
        }

        let prompt_response: PromptResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseError(e.to_string()))?;

        prompt_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::ResponseError("No choices in response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn azure_url_is_built_from_deployment() {
        let mut config = AppConfig::default().llm;
        config.backend = "azure".to_string();
        config.model = "gpt4o-reports".to_string();
        config.api_url = Some("https://example.openai.azure.com/".to_string());
        config.api_key = Some("secret".to_string());
        config.api_version = Some("2024-06-01".to_string());

        let provider = RemoteLlmProvider::azure(&config).unwrap();
        assert_eq!(
            provider.api_url,
            "https://example.openai.azure.com/openai/deployments/gpt4o-reports/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let mut config = AppConfig::default().llm;
        config.api_url = Some("http://localhost:8000/v1/chat/completions".to_string());
        assert!(matches!(
            RemoteLlmProvider::new(&config),
            Err(LlmError::ConfigError(_))
        ));
    }
}

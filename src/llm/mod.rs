pub mod orchestrator;

use crate::config::LlmConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        config: &Value,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>>;

    fn name(&self) -> &'static str;
}

pub fn provider_from_config(cfg: &LlmConfig) -> Arc<dyn LLMProvider> {
    match cfg.provider.as_str() {
        "anthropic" => Arc::new(AnthropicClient::new(
            cfg.api_key.clone(),
            cfg.base_url.clone(),
            cfg.model.clone(),
        )),
        _ => Arc::new(OpenAIClient::new(
            cfg.api_key.clone(),
            cfg.base_url.clone(),
            cfg.model.clone(),
        )),
    }
}

pub struct OpenAIClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAIClient {
    pub fn new(api_key: String, base_url: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
        }
    }
}

#[async_trait]
impl LLMProvider for OpenAIClient {
    async fn generate(
        &self,
        prompt: &str,
        config: &Value,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let max_tokens = config["max_tokens"].as_u64().unwrap_or(1000);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": max_tokens
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(format!("openai returned {}", response.status()).into());
        }

        let result: Value = response.json().await?;
        let content = result["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, base_url: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            model,
        }
    }
}

#[async_trait]
impl LLMProvider for AnthropicClient {
    async fn generate(
        &self,
        prompt: &str,
        config: &Value,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        let max_tokens = config["max_tokens"].as_u64().unwrap_or(1000);
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&serde_json::json!({
                "model": self.model,
                "max_tokens": max_tokens,
                "messages": [{"role": "user", "content": prompt}]
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(format!("anthropic returned {}", response.status()).into());
        }

        let result: Value = response.json().await?;
        let content = result["content"][0]["text"].as_str().unwrap_or("").to_string();
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn openai_client_parses_completion() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "choices": [{"message": {"content": "hello there"}}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = OpenAIClient::new("key".into(), Some(server.url()), "gpt-test".into());
        let reply = client.generate("hi", &Value::Null).await.unwrap();
        assert_eq!(reply, "hello there");
    }

    #[tokio::test]
    async fn anthropic_client_parses_completion() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/messages")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "content": [{"text": "howdy"}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = AnthropicClient::new("key".into(), Some(server.url()), "claude-test".into());
        let reply = client.generate("hi", &Value::Null).await.unwrap();
        assert_eq!(reply, "howdy");
    }

    #[tokio::test]
    async fn upstream_error_status_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .with_body("{}")
            .create_async()
            .await;

        let client = OpenAIClient::new("key".into(), Some(server.url()), "gpt-test".into());
        assert!(client.generate("hi", &Value::Null).await.is_err());
    }
}

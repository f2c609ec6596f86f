//! The `OpenAIClient` struct implements `ClientWrapper` for any OpenAI-compatible
//! Chat Completions endpoint (OpenAI itself, DashScope/Qwen, DeepSeek, ...),
//! capturing both the assistant response and the token usage of the call.
//!
//! # Example
//!
//! ```rust,no_run
//! use forumflow::clients::openai::OpenAIClient;
//! use forumflow::client_wrapper::{ClientWrapper, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let key = std::env::var("DEEPSEEK_API_KEY")?;
//!     let client = OpenAIClient::new_with_base_url(&key, "deepseek-chat", "https://api.deepseek.com");
//!
//!     let reply = client
//!         .send_message(&[
//!             Message::system("You coordinate a research project. Reply briefly."),
//!             Message::user("DECISION or GUIDANCE?"),
//!         ])
//!         .await?;
//!     println!("{}", reply.content);
//!
//!     if let Some(usage) = client.get_last_usage() {
//!         println!("tokens: {} in / {} out", usage.input_tokens, usage.output_tokens);
//!     }
//!     Ok(())
//! }
//! ```

use std::error::Error;
use std::sync::Mutex;

use async_trait::async_trait;
use openai_rust::chat;
use openai_rust2 as openai_rust;

use super::http_pool::get_http_client;
use crate::client_wrapper::{ClientWrapper, Message, Role, TokenUsage};

/// Base URL used when none is configured.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Client wrapper for an OpenAI-compatible Chat Completions API.
pub struct OpenAIClient {
    client: openai_rust::Client,
    model: String,
    base_url: String,
    token_usage: Mutex<Option<TokenUsage>>,
}

impl OpenAIClient {
    /// Client for api.openai.com.
    pub fn new_with_model_string(secret_key: &str, model_name: &str) -> Self {
        OpenAIClient {
            client: openai_rust::Client::new_with_client(
                secret_key,
                get_http_client(DEFAULT_BASE_URL),
            ),
            model: model_name.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            token_usage: Mutex::new(None),
        }
    }

    /// Client for a custom OpenAI-compatible base URL.
    ///
    /// Base URLs are accepted with or without a trailing `/v1`, the form most
    /// providers document.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        let host = api_root(base_url);
        OpenAIClient {
            client: openai_rust::Client::new_with_client_and_base_url(
                secret_key,
                get_http_client(&host),
                &host,
            ),
            model: model_name.to_string(),
            base_url: host,
            token_usage: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Strip trailing slashes and a trailing `/v1` so the chat path can be appended.
fn api_root(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    trimmed
        .strip_suffix("/v1")
        .unwrap_or(trimmed)
        .to_string()
}

#[async_trait]
impl ClientWrapper for OpenAIClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_message(
        &self,
        messages: &[Message],
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        let formatted_messages: Vec<chat::Message> = messages
            .iter()
            .map(|msg| chat::Message {
                role: msg.role.as_str().to_owned(),
                content: msg.content.clone(),
            })
            .collect();

        let chat_arguments = chat::ChatArguments::new(&self.model, formatted_messages);
        let response = self
            .client
            .create_chat(chat_arguments, Some(CHAT_COMPLETIONS_PATH.to_string()))
            .await
            .map_err(|err| {
                log::error!(
                    "OpenAIClient::send_message(...): {} ({}) API error: {}",
                    self.base_url,
                    self.model,
                    err
                );
                format!("chat completion failed: {}", err)
            })?;

        let usage = TokenUsage {
            input_tokens: response.usage.prompt_tokens as usize,
            output_tokens: response.usage.completion_tokens as usize,
            total_tokens: response.usage.total_tokens as usize,
        };
        if let Ok(mut slot) = self.token_usage.lock() {
            *slot = Some(usage);
        }

        let content = response
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .ok_or("chat completion returned no choices")?;

        Ok(Message {
            role: Role::Assistant,
            content,
        })
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.token_usage)
    }
}

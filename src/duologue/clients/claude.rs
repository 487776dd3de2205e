//! Anthropic Claude client built on the OpenAI-compatible transport.
//!
//! The wrapper delegates HTTP concerns to the shared chat helper, so swapping a
//! dialogue participant from Grok to Claude only requires a different
//! constructor.
//!
//! # Example
//!
//! ```rust,no_run
//! use duologue::client_wrapper::GenerationClient;
//! use duologue::clients::claude::{ClaudeClient, Model};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("ANTHROPIC_KEY")?;
//!     let client = ClaudeClient::new_with_model_enum(&key, Model::Claude3Sonnet);
//!     let output = client
//!         .generate("List three idioms for error handling in Rust.", client.model_name())
//!         .await?;
//!     println!("{}", output.text);
//!     Ok(())
//! }
//! ```

use crate::client_wrapper::{GenerationClient, GenerationError, GenerationOutput};
use crate::duologue::clients::common::send_chat;
use async_trait::async_trait;
use openai_rust2 as openai_rust;

/// Client for Anthropic's Claude API routed through the OpenAI compatible surface.
pub struct ClaudeClient {
    client: openai_rust::Client,
    model: String,
}

// Models priced in the dialogue price table as of this snapshot.
pub enum Model {
    Claude3Opus,   // $15/MMT input $75/MMT output
    Claude3Sonnet, // $3/MMT input $15/MMT output
    Claude3Haiku,  // $0.25/MMT input $1.25/MMT output
}

fn model_to_string(model: Model) -> String {
    match model {
        Model::Claude3Opus => "claude-3-opus-20240229".to_string(),
        Model::Claude3Sonnet => "claude-3-sonnet-20240229".to_string(),
        Model::Claude3Haiku => "claude-3-haiku-20240307".to_string(),
    }
}

impl ClaudeClient {
    /// Create a client from an API key and strongly typed model variant.
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_str(secret_key, &model_to_string(model))
    }

    /// Create a client from an API key and explicit model string.
    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, "https://api.anthropic.com/v1")
    }

    /// Create a client pointing at a custom Claude-compatible base URL.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        ClaudeClient {
            client: openai_rust::Client::new_with_base_url(secret_key, base_url),
            model: model_name.to_string(),
        }
    }
}

#[async_trait]
impl GenerationClient for ClaudeClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<GenerationOutput, GenerationError> {
        send_chat(&self.client, model, prompt, None).await
    }
}

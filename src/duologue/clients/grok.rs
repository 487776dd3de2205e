use crate::client_wrapper::{GenerationClient, GenerationError, GenerationOutput};
use crate::duologue::clients::common::send_chat;
use async_trait::async_trait;
use openai_rust2 as openai_rust;

/// Client for xAI's Grok API routed through the OpenAI compatible surface.
pub struct GrokClient {
    client: openai_rust::Client,
    model: String,
}

// Models returned by the xAI API as of this snapshot
pub enum Model {
    Grok4FastReasoningLatest,    // $2/MMT input $10/MMT output
    Grok4FastReasoning,          // $2/MMT input $10/MMT output
    Grok4FastNonReasoningLatest, // $1/MMT input $5/MMT output
    Grok4FastNonReasoning,       // $1/MMT input $5/MMT output
    GrokCodeFast1,               // $3/MMT input $15/MMT output
    Grok2VisionLatest,           // $2/MMT input $10/MMT output
}

fn model_to_string(model: Model) -> String {
    match model {
        Model::Grok4FastReasoningLatest => "grok-4-fast-reasoning-latest".to_string(),
        Model::Grok4FastReasoning => "grok-4-fast-reasoning".to_string(),
        Model::Grok4FastNonReasoningLatest => "grok-4-fast-non-reasoning-latest".to_string(),
        Model::Grok4FastNonReasoning => "grok-4-fast-non-reasoning".to_string(),
        Model::GrokCodeFast1 => "grok-code-fast-1".to_string(),
        Model::Grok2VisionLatest => "grok-2-vision-latest".to_string(),
    }
}

impl GrokClient {
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_str(secret_key, &model_to_string(model))
    }

    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, "https://api.x.ai/v1")
    }

    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        GrokClient {
            client: openai_rust::Client::new_with_base_url(secret_key, base_url),
            model: model_name.to_string(),
        }
    }
}

#[async_trait]
impl GenerationClient for GrokClient {
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

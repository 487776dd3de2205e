use crate::client_wrapper::{GenerationError, GenerationOutput, TokenUsage};
use openai_rust::chat;
use openai_rust2 as openai_rust;

/// Send a single-prompt chat request and return the assistant's content plus
/// token usage, with the provider error classified into the engine's retry
/// taxonomy.
pub async fn send_chat(
    api: &openai_rust::Client,
    model: &str,
    prompt: &str,
    url_path: Option<String>,
) -> Result<GenerationOutput, GenerationError> {
    let formatted_msgs = vec![chat::Message {
        role: "user".to_owned(),
        content: prompt.to_owned(),
    }];

    let chat_arguments = chat::ChatArguments::new(model, formatted_msgs);

    let response = api.create_chat(chat_arguments, url_path).await;

    match response {
        Ok(response) => {
            let usage = TokenUsage {
                prompt: response.usage.prompt_tokens as usize,
                completion: response.usage.completion_tokens as usize,
                total: response.usage.total_tokens as usize,
            };

            Ok(GenerationOutput {
                text: response.choices[0].message.content.clone(),
                usage,
            })
        }
        Err(err) => {
            log::error!("duologue::clients::common::send_chat(...): API Error: {}", err);
            Err(classify_provider_error(&err.to_string()))
        }
    }
}

/// Map a provider error message onto the retry taxonomy.
///
/// Rate-limit signals (HTTP 429) and connection-level failures are worth
/// retrying; everything else is fatal for the turn. Matching on the message
/// text keeps the classification independent of the transport's error type.
pub fn classify_provider_error(message: &str) -> GenerationError {
    let lowered = message.to_lowercase();

    let rate_limited = lowered.contains("429") || lowered.contains("rate limit");
    let connection = lowered.contains("connect")
        || lowered.contains("connection")
        || lowered.contains("timed out")
        || lowered.contains("timeout");

    if rate_limited || connection {
        GenerationError::Transient(message.to_owned())
    } else {
        GenerationError::Fatal(message.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::classify_provider_error;
    use crate::client_wrapper::GenerationError;

    #[test]
    fn rate_limit_is_transient() {
        let err = classify_provider_error("HTTP status client error (429 Too Many Requests)");
        assert!(matches!(err, GenerationError::Transient(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn connection_failure_is_transient() {
        let err = classify_provider_error("error sending request: connection refused");
        assert!(matches!(err, GenerationError::Transient(_)));
    }

    #[test]
    fn anything_else_is_fatal() {
        let err = classify_provider_error("invalid model identifier");
        assert!(matches!(err, GenerationError::Fatal(_)));
        assert!(!err.is_retryable());
    }
}

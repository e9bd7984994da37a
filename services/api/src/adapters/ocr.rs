//! services/api/src/adapters/ocr.rs
//!
//! Vision-model OCR. Implements the `OcrService` port by sending the image inline
//! with a fixed extraction instruction.

use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    types::{ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs},
    Client,
};
use async_trait::async_trait;
use study_core::ports::{OcrService, PortError, PortResult};

use super::llm::{first_content, image_part, map_openai_error, text_part, unexpected};

const OCR_MAX_TOKENS: u32 = 4096;

#[derive(Clone)]
pub struct OpenAiOcrAdapter {
    client: Option<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAiOcrAdapter {
    pub fn new(client: Option<Client<OpenAIConfig>>, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl OcrService for OpenAiOcrAdapter {
    async fn recognize(&self, image: &[u8], mime_type: &str, instruction: &str, timeout: Duration) -> PortResult<String> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| PortError::NotConfigured("OPENAI_API_KEY".to_string()))?;

        let message = ChatCompletionRequestUserMessageArgs::default()
            .content(vec![text_part(instruction)?, image_part(mime_type, image)?])
            .build()
            .map_err(unexpected)?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![message.into()])
            .n(1)
            .max_completion_tokens(OCR_MAX_TOKENS)
            .temperature(0.0)
            .build()
            .map_err(unexpected)?;

        let response = tokio::time::timeout(timeout, client.chat().create(request))
            .await
            .map_err(|_| PortError::Timeout(timeout))?
            .map_err(|e| map_openai_error(e, timeout))?;

        // An image with no readable text legitimately yields an empty answer.
        match first_content(response) {
            Ok(text) => Ok(text),
            Err(PortError::Unexpected(_)) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }
}

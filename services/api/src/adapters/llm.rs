//! services/api/src/adapters/llm.rs
//!
//! This module contains the adapter for the study-plan generating LLM.
//! It implements the `LanguageModel` port from the `core` crate on top of
//! OpenAI chat completions with a JSON-schema response format.

use std::time::Duration;

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
        CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs, ResponseFormat,
        ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use study_core::ports::{CompletionRequest, InlineImage, LanguageModel, PortError, PortResult};
use tracing::debug;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `LanguageModel` using an OpenAI-compatible chat model.
///
/// Built without a client when no API key is configured, in which case every call
/// fails with `PortError::NotConfigured` and the request surfaces `OPENAI_KEY_MISSING`.
#[derive(Clone)]
pub struct OpenAiLanguageModel {
    client: Option<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAiLanguageModel {
    pub fn new(client: Option<Client<OpenAIConfig>>, model: String) -> Self {
        Self { client, model }
    }
}

//=========================================================================================
// Shared helpers (also used by the OCR adapter)
//=========================================================================================

pub(crate) fn unexpected(e: OpenAIError) -> PortError {
    PortError::Unexpected(e.to_string())
}

/// Maps an OpenAI client error onto the port taxonomy so the core can decide on retries.
pub(crate) fn map_openai_error(e: OpenAIError, timeout: Duration) -> PortError {
    match e {
        OpenAIError::ApiError(api) => {
            let code = api.code.as_deref().unwrap_or_default();
            let kind = api.r#type.as_deref().unwrap_or_default();
            if code == "invalid_api_key" || kind == "authentication_error" {
                PortError::Unauthorized
            } else if code == "rate_limit_exceeded" || kind == "insufficient_quota" || kind == "rate_limit_error" {
                PortError::RateLimited(api.message)
            } else if kind == "server_error" {
                PortError::Upstream { status: 500, message: api.message }
            } else {
                PortError::Upstream { status: 400, message: api.message }
            }
        }
        OpenAIError::Reqwest(err) => {
            if err.is_timeout() {
                PortError::Timeout(timeout)
            } else if let Some(status) = err.status() {
                PortError::Upstream { status: status.as_u16(), message: err.to_string() }
            } else {
                PortError::Unexpected(err.to_string())
            }
        }
        other => PortError::Unexpected(other.to_string()),
    }
}

/// Renders an image as a `data:` URL content part.
pub(crate) fn image_part(mime_type: &str, data: &[u8]) -> PortResult<ChatCompletionRequestUserMessageContentPart> {
    let url = format!("data:{};base64,{}", mime_type, STANDARD.encode(data));
    Ok(ChatCompletionRequestMessageContentPartImageArgs::default()
        .image_url(
            ImageUrlArgs::default()
                .url(url)
                .detail(ImageDetail::High)
                .build()
                .map_err(unexpected)?,
        )
        .build()
        .map_err(unexpected)?
        .into())
}

pub(crate) fn text_part(text: &str) -> PortResult<ChatCompletionRequestUserMessageContentPart> {
    Ok(ChatCompletionRequestMessageContentPartTextArgs::default()
        .text(text)
        .build()
        .map_err(unexpected)?
        .into())
}

/// Pulls the text content out of the first choice.
pub(crate) fn first_content(
    response: async_openai::types::CreateChatCompletionResponse,
) -> PortResult<String> {
    response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| PortError::Unexpected("Model returned no choices in its response.".to_string()))?
        .message
        .content
        .ok_or_else(|| PortError::Unexpected("Model response contained no text content.".to_string()))
}

fn user_message(text: &str, images: &[InlineImage]) -> PortResult<ChatCompletionRequestMessage> {
    let message = if images.is_empty() {
        ChatCompletionRequestUserMessageArgs::default()
            .content(text)
            .build()
            .map_err(unexpected)?
    } else {
        let mut parts = vec![text_part(text)?];
        for image in images {
            parts.push(image_part(&image.mime_type, &image.data)?);
        }
        ChatCompletionRequestUserMessageArgs::default()
            .content(parts)
            .build()
            .map_err(unexpected)?
    };
    Ok(message.into())
}

//=========================================================================================
// `LanguageModel` Trait Implementation
//=========================================================================================

#[async_trait]
impl LanguageModel for OpenAiLanguageModel {
    async fn complete(&self, request: CompletionRequest) -> PortResult<String> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| PortError::NotConfigured("OPENAI_API_KEY".to_string()))?;

        let messages = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(request.system.as_str())
                .build()
                .map_err(unexpected)?
                .into(),
            user_message(&request.user, &request.images)?,
        ];

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(messages)
            .n(1)
            .max_completion_tokens(request.max_tokens)
            .temperature(request.temperature);
        if let Some(schema) = request.response_schema {
            builder.response_format(ResponseFormat::JsonSchema {
                json_schema: ResponseFormatJsonSchema {
                    description: None,
                    name: "study_document".to_string(),
                    schema: Some(schema),
                    strict: Some(false),
                },
            });
        }
        let chat_request = builder.build().map_err(unexpected)?;

        debug!(model = %self.model, images = request.images.len(), "Sending completion request");
        let timeout = request.timeout;
        let response = tokio::time::timeout(timeout, client.chat().create(chat_request))
            .await
            .map_err(|_| PortError::Timeout(timeout))?
            .map_err(|e| map_openai_error(e, timeout))?;

        first_content(response)
    }
}

use async_trait::async_trait;
use homecare_common::{HomecareError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::client::{LlmClient, LlmRequest, LlmResponse, Role, TokenUsage};

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct OpenAiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    model: String,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Client for OpenAI-compatible chat completion endpoints.
pub struct OpenAiClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<String>,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HomecareError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model,
            api_key,
            http_client,
        })
    }

    fn role_to_string(role: &Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn build_body(&self, request: &LlmRequest) -> OpenAiRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system_prompt {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: Some(system.clone()),
            });
        }
        messages.extend(request.messages.iter().map(|msg| OpenAiMessage {
            role: Self::role_to_string(&msg.role).to_string(),
            content: Some(msg.content.clone()),
        }));

        OpenAiRequest {
            model: self.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_body(&request);

        let mut http_req = self.http_client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| HomecareError::Extraction(format!("OpenAI request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(HomecareError::Extraction(format!(
                "OpenAI API error {status}: {body_text}"
            )));
        }

        let oai_response: OpenAiResponse = response.json().await.map_err(|e| {
            HomecareError::Extraction(format!("Failed to parse OpenAI response: {e}"))
        })?;

        let choice = oai_response.choices.into_iter().next().ok_or_else(|| {
            HomecareError::Extraction("No choices in OpenAI response".to_string())
        })?;

        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            model: oai_response.model,
            usage: oai_response.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
            finish_reason: choice.finish_reason,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ChatMessage;

    fn client() -> OpenAiClient {
        OpenAiClient::new(
            None,
            "gpt-4o-mini".to_string(),
            Some("sk-test".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn request_body_includes_system_and_json_mode() {
        let request = LlmRequest {
            system_prompt: Some("Extract facts.".to_string()),
            messages: vec![ChatMessage::user("Message 1: Allergic to penicillin")],
            temperature: Some(0.0),
            max_tokens: Some(2000),
            json_mode: true,
        };

        let json = serde_json::to_value(client().build_body(&request)).unwrap();

        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["max_tokens"], 2000);
        assert_eq!(json["response_format"]["type"], "json_object");

        let messages = json["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[1]["content"], "Message 1: Allergic to penicillin");
    }

    #[test]
    fn request_body_omits_optional_fields() {
        let request = LlmRequest {
            messages: vec![ChatMessage::user("Hello")],
            ..Default::default()
        };

        let json = serde_json::to_value(client().build_body(&request)).unwrap();

        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert!(json.get("temperature").is_none());
        assert!(json.get("max_tokens").is_none());
        assert!(json.get("response_format").is_none());
    }

    #[test]
    fn base_url_defaults_and_trims_trailing_slash() {
        assert_eq!(client().base_url, "https://api.openai.com");

        let custom = OpenAiClient::new(
            Some("http://localhost:11434/".to_string()),
            "llama3".to_string(),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(custom.base_url, "http://localhost:11434");
    }
}

//! Google Gemini LLM provider implementation
//!
//! SECURITY: API keys are ONLY sent to the configured Google endpoint.

use super::streaming::SseDecoder;
use super::{
    ContentPart, LlmError, LlmProvider, LlmResponse, Message, MessageContent, Role,
    StreamCallback, StreamEvent, StreamingResponseBuilder, TokenUsage, ToolCall, ToolDefinition,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

/// Official Google Gemini API endpoint
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: usize,
}

impl GeminiProvider {
    pub fn new() -> Result<Self> {
        let api_key =
            env::var("GEMINI_API_KEY").map_err(|_| LlmError::MissingCredential("GEMINI_API_KEY"))?;
        Ok(Self::with_api_key(api_key))
    }

    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: GEMINI_API_BASE.to_string(),
            model: "gemini-2.0-flash".to_string(),
            max_tokens: 8192,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Point requests at another endpoint (proxies, test servers)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn convert_messages(&self, messages: &[Message]) -> (Option<String>, Vec<GeminiContent>) {
        let mut system_instruction: Option<String> = None;
        let mut contents: Vec<GeminiContent> = Vec::new();
        // Gemini keys function responses by name, the agent keys them by call id
        let mut call_names: HashMap<String, String> = HashMap::new();

        for msg in messages {
            match msg.role {
                Role::System => {
                    if let Some(text) = msg.content.as_text() {
                        match system_instruction.as_mut() {
                            Some(existing) => {
                                existing.push_str("\n\n");
                                existing.push_str(text);
                            }
                            None => system_instruction = Some(text.to_string()),
                        }
                    }
                }
                Role::User => {
                    if let Some(text) = msg.content.as_text() {
                        contents.push(GeminiContent {
                            role: "user".to_string(),
                            parts: vec![GeminiPart::Text {
                                text: text.to_string(),
                            }],
                        });
                    }
                }
                Role::Assistant => {
                    let parts = match &msg.content {
                        MessageContent::Text(text) => vec![GeminiPart::Text { text: text.clone() }],
                        MessageContent::Parts(parts) => parts
                            .iter()
                            .map(|part| match part {
                                ContentPart::Text { text } => GeminiPart::Text { text: text.clone() },
                                ContentPart::ToolUse { id, name, input } => {
                                    call_names.insert(id.clone(), name.clone());
                                    GeminiPart::FunctionCall {
                                        function_call: GeminiFunctionCall {
                                            name: name.clone(),
                                            args: input.clone(),
                                        },
                                    }
                                }
                            })
                            .collect(),
                    };
                    contents.push(GeminiContent {
                        role: "model".to_string(),
                        parts,
                    });
                }
                Role::Tool => {
                    let name = msg
                        .tool_call_id
                        .as_ref()
                        .and_then(|id| call_names.get(id))
                        .cloned()
                        .unwrap_or_else(|| "tool".to_string());
                    let part = GeminiPart::FunctionResponse {
                        function_response: GeminiFunctionResponse {
                            name,
                            response: serde_json::json!({
                                "content": msg.content.as_text().unwrap_or_default()
                            }),
                        },
                    };
                    // Responses to one model turn travel together
                    match contents.last_mut() {
                        Some(last)
                            if last.role == "user"
                                && last
                                    .parts
                                    .iter()
                                    .all(|p| matches!(p, GeminiPart::FunctionResponse { .. })) =>
                        {
                            last.parts.push(part)
                        }
                        _ => contents.push(GeminiContent {
                            role: "user".to_string(),
                            parts: vec![part],
                        }),
                    }
                }
            }
        }

        (system_instruction, contents)
    }

    fn convert_tools(&self, tools: &[ToolDefinition]) -> Vec<GeminiFunctionDeclaration> {
        tools
            .iter()
            .map(|t| GeminiFunctionDeclaration {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect()
    }

    fn build_request(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> GeminiRequest {
        let (system_instruction, contents) = self.convert_messages(messages);

        GeminiRequest {
            contents,
            system_instruction: system_instruction.map(|text| GeminiSystemInstruction {
                parts: vec![GeminiPart::Text { text }],
            }),
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: Some(self.max_tokens),
                temperature: Some(1.0),
            }),
            tools: tools.filter(|t| !t.is_empty()).map(|tools| {
                vec![GeminiTools {
                    function_declarations: self.convert_tools(tools),
                }]
            }),
        }
    }

    async fn post(&self, url: &str, request: &GeminiRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(LlmError::from_network_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_http_status(status, error_text).into());
        }

        Ok(response)
    }
}

fn usage_from(metadata: &GeminiUsageMetadata) -> TokenUsage {
    TokenUsage {
        input_tokens: metadata.prompt_token_count,
        output_tokens: metadata.candidates_token_count,
        total_tokens: metadata.total_token_count,
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse> {
        let request = self.build_request(messages, tools);
        let url = format!("{}/{}:generateContent", self.base_url, self.model);

        let response = self
            .post(&url, &request)
            .await?
            .json::<GeminiResponse>()
            .await
            .context("Failed to parse Gemini API response")?;

        let usage = response.usage_metadata.as_ref().map(usage_from);

        let Some(candidate) = response.candidates.first() else {
            return Ok(LlmResponse::Text {
                text: String::new(),
                usage,
            });
        };

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();

        for part in &candidate.content.parts {
            match part {
                GeminiPart::Text { text } => text_parts.push(text.clone()),
                GeminiPart::FunctionCall { function_call } => tool_calls.push(ToolCall {
                    // Gemini doesn't provide IDs
                    id: format!("call_{}_{}", tool_calls.len(), function_call.name),
                    name: function_call.name.clone(),
                    arguments: function_call.args.clone(),
                }),
                GeminiPart::FunctionResponse { .. } => {}
            }
        }

        if tool_calls.is_empty() {
            Ok(LlmResponse::Text {
                text: text_parts.join(""),
                usage,
            })
        } else if text_parts.is_empty() {
            Ok(LlmResponse::ToolCalls {
                calls: tool_calls,
                usage,
            })
        } else {
            Ok(LlmResponse::Mixed {
                text: Some(text_parts.join("")),
                tool_calls,
                usage,
            })
        }
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat_streaming(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        callback: StreamCallback,
    ) -> Result<LlmResponse> {
        use futures::StreamExt;
        use tokio::time::{timeout, Duration};

        const STREAM_CHUNK_TIMEOUT: Duration = Duration::from_secs(60);

        let request = self.build_request(messages, tools);
        let url = format!(
            "{}/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );

        let response = match self.post(&url, &request).await {
            Ok(response) => response,
            Err(e) => {
                callback(StreamEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let mut builder = StreamingResponseBuilder::new();
        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();
        let mut call_index = 0usize;

        loop {
            let payloads = match timeout(STREAM_CHUNK_TIMEOUT, stream.next()).await {
                Ok(Some(chunk)) => {
                    let chunk = chunk.map_err(LlmError::from_network_error)?;
                    decoder.push(&chunk)
                }
                Ok(None) => {
                    let rest = decoder.finish();
                    if rest.is_empty() {
                        break;
                    }
                    rest
                }
                Err(_) => {
                    return Err(LlmError::Network(format!(
                        "Stream timeout - no response from Gemini for {} seconds",
                        STREAM_CHUNK_TIMEOUT.as_secs()
                    ))
                    .into());
                }
            };

            for payload in payloads {
                let Ok(chunk) = serde_json::from_str::<GeminiStreamChunk>(&payload) else {
                    tracing::debug!("Skipping unparseable Gemini stream payload");
                    continue;
                };

                if let Some(candidate) = chunk.candidates.first() {
                    for part in &candidate.content.parts {
                        match part {
                            GeminiPart::Text { text } if !text.is_empty() => {
                                let event = StreamEvent::TextDelta(text.clone());
                                builder.process(&event);
                                callback(event);
                            }
                            GeminiPart::FunctionCall { function_call } => {
                                let id = format!("call_{}_{}", call_index, function_call.name);
                                call_index += 1;
                                let events = [
                                    StreamEvent::ToolCallStart {
                                        id: id.clone(),
                                        name: function_call.name.clone(),
                                    },
                                    StreamEvent::ToolCallDelta {
                                        id: id.clone(),
                                        arguments_delta: function_call.args.to_string(),
                                    },
                                    StreamEvent::ToolCallComplete { id },
                                ];
                                for event in events {
                                    builder.process(&event);
                                    callback(event);
                                }
                            }
                            _ => {}
                        }
                    }
                }

                if let Some(usage) = chunk.usage_metadata.as_ref() {
                    builder.usage = Some(usage_from(usage));
                }
            }
        }

        callback(StreamEvent::Done);
        Ok(builder.build())
    }
}

// Gemini API types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTools>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponse,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct GeminiTools {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiUsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_gemini_response() {
        let json = r#"{
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"text": "Hello, world!"}]
                }
            }],
            "usageMetadata": {
                "promptTokenCount": 10,
                "candidatesTokenCount": 5,
                "totalTokenCount": 15
            }
        }"#;

        let response: GeminiResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.candidates.len(), 1);
        let usage = usage_from(response.usage_metadata.as_ref().unwrap());
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn test_tool_round_trip_converts_to_function_parts() {
        let provider = GeminiProvider::with_api_key("k");
        let call = ToolCall {
            id: "call_0_show_tables".into(),
            name: "show_tables".into(),
            arguments: json!({}),
        };
        let messages = vec![
            Message::system("be helpful"),
            Message::user("what tables?"),
            Message::assistant_tool_calls(None, &[call]),
            Message::tool_result("call_0_show_tables", "sales"),
        ];

        let request = provider.build_request(&messages, None);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "be helpful");
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(
            value["contents"][1]["parts"][0]["functionCall"]["name"],
            "show_tables"
        );
        assert_eq!(
            value["contents"][2]["parts"][0]["functionResponse"]["name"],
            "show_tables"
        );
        assert_eq!(
            value["contents"][2]["parts"][0]["functionResponse"]["response"]["content"],
            "sales"
        );
        assert!(value.get("tools").is_none());
    }

    #[tokio::test]
    async fn test_streaming_against_mock_server() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"lo\"}]}}],",
            "\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2,\"totalTokenCount\":5}}\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/gemini-test:streamGenerateContent"))
            .and(header("x-goog-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = GeminiProvider::with_api_key("secret")
            .with_model("gemini-test")
            .with_base_url(&server.uri());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let response = provider
            .chat_streaming(
                &[Message::user("hi")],
                None,
                Box::new(move |e| sink.lock().unwrap().push(e)),
            )
            .await
            .unwrap();

        assert_eq!(response.text(), Some("Hello"));
        assert_eq!(response.usage().map(|u| u.total_tokens), Some(5));
        let events = seen.lock().unwrap();
        assert_eq!(events[0], StreamEvent::TextDelta("Hel".into()));
        assert_eq!(events[1], StreamEvent::TextDelta("lo".into()));
        assert_eq!(events[2], StreamEvent::Done);
    }

    #[tokio::test]
    async fn test_http_error_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
            .mount(&server)
            .await;

        let provider = GeminiProvider::with_api_key("k").with_base_url(&server.uri());
        let err = provider
            .chat(&[Message::user("hi")], None)
            .await
            .unwrap_err();

        let typed = err.downcast_ref::<LlmError>().unwrap();
        assert!(matches!(typed, LlmError::RateLimited(_)));
    }
}

//! Client for the Gemini `generativelanguage` REST API: batched embeddings and
//! streamed generation with function calling.

use crate::embeddings::Embedder;
use crate::error::{EmbeddingError, GenerationError};
use crate::generation::{GenerationTurn, ModelEvent, ModelEventStream, ToolCall, TurnMessage};
use crate::traits::GenerationBackend;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use tracing::debug;
use url::Url;

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, url::ParseError> {
        Url::parse(base_url)?;
        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self, model: &str, method: &str) -> Result<Url, url::ParseError> {
        let model = model.trim_start_matches("models/");
        Url::parse(&format!("{}/models/{model}:{method}", self.base_url))
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(300).collect())
}

fn status_error(status: StatusCode, body: &str) -> GenerationError {
    let message = format!("HTTP {status}: {}", error_message(body));
    match status {
        StatusCode::TOO_MANY_REQUESTS => GenerationError::RateLimited(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            GenerationError::Network(message)
        }
        _ => GenerationError::Backend {
            backend: "gemini".to_string(),
            details: message,
        },
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest {
    model: String,
    content: Content,
    output_dimensionality: usize,
}

#[derive(Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedRequest>,
}

#[derive(Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

pub struct GeminiEmbedder {
    client: GeminiClient,
    model: String,
    dimensions: usize,
}

impl GeminiEmbedder {
    pub fn new(client: GeminiClient, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            client,
            model: model.into(),
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for GeminiEmbedder {
    fn name(&self) -> &str {
        "gemini"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = format!("models/{}", self.model.trim_start_matches("models/"));
        let request = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedRequest {
                    model: model.clone(),
                    content: Content::text("user", text),
                    output_dimensionality: self.dimensions,
                })
                .collect(),
        };

        let url = self.client.endpoint(&self.model, "batchEmbedContents")?;
        let response = self
            .client
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.client.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Backend {
                backend: "gemini".to_string(),
                details: format!("HTTP {status}: {}", error_message(&body)),
            });
        }

        let parsed: BatchEmbedResponse = response.json().await?;
        debug!(texts = texts.len(), "embedded batch");
        Ok(parsed
            .embeddings
            .into_iter()
            .map(|embedding| embedding.values)
            .collect())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Content {
    role: String,
    parts: Vec<Value>,
}

impl Content {
    fn text(role: &str, text: &str) -> Self {
        Self {
            role: role.to_string(),
            parts: vec![json!({ "text": text })],
        }
    }
}

/// Maps the backend-neutral transcript onto Gemini contents. Consecutive
/// messages of the same role share one content entry.
fn contents(messages: &[TurnMessage]) -> Vec<Content> {
    let mut contents: Vec<Content> = Vec::new();
    for message in messages {
        let (role, part) = match message {
            TurnMessage::User(text) => ("user", json!({ "text": text })),
            TurnMessage::Model(text) => ("model", json!({ "text": text })),
            TurnMessage::ToolCall(call) => (
                "model",
                json!({ "functionCall": { "name": call.name, "args": call.arguments } }),
            ),
            TurnMessage::ToolResult {
                name,
                content,
                is_error,
            } => {
                let response = if *is_error {
                    json!({ "error": content })
                } else {
                    json!({ "result": content })
                };
                (
                    "user",
                    json!({ "functionResponse": { "name": name, "response": response } }),
                )
            }
        };
        match contents.last_mut() {
            Some(last) if last.role == role => last.parts.push(part),
            _ => contents.push(Content {
                role: role.to_string(),
                parts: vec![part],
            }),
        }
    }
    contents
}

fn generate_request(turn: &GenerationTurn) -> Value {
    let mut request = json!({
        "systemInstruction": { "parts": [{ "text": turn.system }] },
        "contents": contents(&turn.messages),
        "generationConfig": {
            "temperature": turn.temperature,
            "maxOutputTokens": turn.max_output_tokens,
        },
    });
    if !turn.tools.is_empty() {
        let declarations = turn
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect::<Vec<_>>();
        request["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    request
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    function_call: Option<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

fn parse_payload(payload: &str) -> Vec<Result<ModelEvent, GenerationError>> {
    let response = match serde_json::from_str::<StreamResponse>(payload) {
        Ok(response) => response,
        Err(error) => {
            return vec![Err(GenerationError::Backend {
                backend: "gemini".to_string(),
                details: format!("unreadable stream event: {error}"),
            })]
        }
    };

    if let Some(error) = response.error {
        return vec![Err(GenerationError::Backend {
            backend: "gemini".to_string(),
            details: error["message"].as_str().unwrap_or("stream error").to_string(),
        })];
    }

    let mut events = Vec::new();
    for candidate in response.candidates.into_iter().take(1) {
        let parts = candidate.content.map(|content| content.parts).unwrap_or_default();
        if parts.is_empty() && candidate.finish_reason.as_deref() == Some("SAFETY") {
            events.push(Err(GenerationError::Backend {
                backend: "gemini".to_string(),
                details: "response blocked by safety filters".to_string(),
            }));
        }
        for part in parts {
            if let Some(call) = part.function_call {
                events.push(Ok(ModelEvent::ToolCall(ToolCall {
                    name: call.name,
                    arguments: call.args,
                })));
            } else if let Some(text) = part.text.filter(|text| !text.is_empty()) {
                events.push(Ok(ModelEvent::Text(text)));
            }
        }
    }
    events
}

/// Incremental server-sent-events reader yielding the `data:` payload of each event.
/// Bytes are buffered until a full line arrives, so characters split across
/// network chunks decode intact.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let raw = self.buffer.drain(..=newline).collect::<Vec<_>>();
            let line = String::from_utf8_lossy(&raw[..newline]);
            self.line(line.trim_end_matches('\r'), &mut payloads);
        }
        payloads
    }

    fn finish(&mut self) -> Vec<String> {
        let mut payloads = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        let rest = String::from_utf8_lossy(&rest);
        if !rest.trim().is_empty() {
            self.line(rest.trim_end_matches('\r'), &mut payloads);
        }
        self.line("", &mut payloads);
        payloads
    }

    fn line(&mut self, line: &str, payloads: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                payloads.push(self.data.join("\n"));
                self.data.clear();
            }
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data.push(data.trim_start().to_string());
        }
    }
}

pub struct GeminiGenerator {
    client: GeminiClient,
    model: String,
}

impl GeminiGenerator {
    pub fn new(client: GeminiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl GenerationBackend for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn generate_stream(
        &self,
        turn: &GenerationTurn,
    ) -> Result<ModelEventStream, GenerationError> {
        let mut url = self.client.endpoint(&self.model, "streamGenerateContent")?;
        url.query_pairs_mut().append_pair("alt", "sse");

        let response = self
            .client
            .client
            .post(url)
            .header(API_KEY_HEADER, &self.client.api_key)
            .json(&generate_request(turn))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        debug!(model = %self.model, "generation stream opened");

        let bytes = Box::pin(response.bytes_stream());
        let state = (bytes, SseDecoder::default(), VecDeque::new(), false);
        let events = futures::stream::unfold(state, |(mut bytes, mut decoder, mut pending, mut done)| async move {
            loop {
                if let Some(event) = pending.pop_front() {
                    return Some((event, (bytes, decoder, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        for payload in decoder.push(&chunk) {
                            pending.extend(parse_payload(&payload));
                        }
                    }
                    Some(Err(error)) => {
                        done = true;
                        pending.push_back(Err(GenerationError::from(error)));
                    }
                    None => {
                        done = true;
                        for payload in decoder.finish() {
                            pending.extend(parse_payload(&payload));
                        }
                    }
                }
            }
        });

        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_events_may_span_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        let payloads = decoder.push(b"1}\r\n\r\ndata: {\"b\":2}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert!(decoder.push(b"data: {\"c\":3}").is_empty());
        assert_eq!(decoder.finish(), vec!["{\"c\":3}"]);
    }

    #[test]
    fn sse_decoder_keeps_characters_split_across_chunks() {
        let event = "data: {\"t\":\"café €\"}\n\n".as_bytes();
        let split = event.iter().position(|byte| *byte == 0xC3).unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&event[..split]).is_empty());
        assert_eq!(decoder.push(&event[split..]), vec!["{\"t\":\"café €\"}"]);
    }

    #[test]
    fn text_and_function_calls_become_events() {
        let payload = r#"{"candidates":[{"content":{"role":"model","parts":[
            {"text":"Revenue grew "},
            {"functionCall":{"name":"calculator","args":{"expression":"2+2"}}}
        ]}}]}"#;
        let events = parse_payload(payload)
            .into_iter()
            .map(|event| event.unwrap())
            .collect::<Vec<_>>();
        assert_eq!(events[0], ModelEvent::Text("Revenue grew ".to_string()));
        assert!(matches!(&events[1], ModelEvent::ToolCall(call) if call.name == "calculator"));
    }

    #[test]
    fn error_payloads_surface_as_backend_errors() {
        let events = parse_payload(r#"{"error":{"code":500,"message":"internal"}}"#);
        assert!(matches!(
            &events[0],
            Err(GenerationError::Backend { details, .. }) if details == "internal"
        ));
    }

    #[test]
    fn rate_limits_are_transient() {
        let error = status_error(
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":{"message":"quota exceeded"}}"#,
        );
        assert!(error.is_transient());
        assert!(error.to_string().contains("quota exceeded"));
        assert!(!status_error(StatusCode::BAD_REQUEST, "bad").is_transient());
    }

    #[test]
    fn transcript_merges_roles_and_wraps_tool_results() {
        let messages = vec![
            TurnMessage::User("question".to_string()),
            TurnMessage::Model("thinking".to_string()),
            TurnMessage::ToolCall(ToolCall {
                name: "calculator".to_string(),
                arguments: json!({ "expression": "1+1" }),
            }),
            TurnMessage::ToolResult {
                name: "calculator".to_string(),
                content: "Result: 2".to_string(),
                is_error: false,
            },
        ];
        let contents = contents(&messages);
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1].role, "model");
        assert_eq!(contents[1].parts.len(), 2);
        assert_eq!(
            contents[2].parts[0]["functionResponse"]["response"]["result"],
            "Result: 2"
        );
    }

    #[test]
    fn endpoints_keep_the_api_version_path() {
        let client = GeminiClient::new("https://example.test/v1beta/", "key").unwrap();
        let url = client.endpoint("models/text-embedding-004", "batchEmbedContents").unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.test/v1beta/models/text-embedding-004:batchEmbedContents"
        );
    }
}

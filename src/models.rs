use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::image_store::{ImageReference, ImageStoreError, InlineImage};
use crate::report::{parse_final_report, FinalReport};
use crate::session::{Role, ToolCallRequest, ToolPayload, Turn, TurnContent};
use crate::settings::ModelParams;

/// Function declaration advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Everything the model sees for one call. Borrowed from the session so a
/// retry does not copy the history.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub model: &'a str,
    pub system_instruction: &'a str,
    pub tools: &'a [ToolDeclaration],
    pub params: &'a ModelParams,
    pub history: &'a [Turn],
}

/// The three mutually exclusive shapes a model reply can take.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    Thought { text: String },
    ToolCall { request: ToolCallRequest, reasoning: Option<String> },
    Final { text: String, report: FinalReport },
}

impl ModelReply {
    /// Classify raw reply parts. A final-answer marker in the text ends the
    /// session even if a tool call rides along; otherwise a tool call wins
    /// over free text.
    pub fn classify(text: Option<String>, call: Option<ToolCallRequest>) -> Result<Self, ModelError> {
        let text = text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        if let Some(t) = &text {
            if let Some(report) = parse_final_report(t) {
                return Ok(ModelReply::Final { text: t.clone(), report });
            }
        }
        match (call, text) {
            (Some(request), reasoning) => {
                if request.name.trim().is_empty() {
                    return Err(ModelError::Malformed("function call without a name".into()));
                }
                Ok(ModelReply::ToolCall { request, reasoning })
            }
            (None, Some(text)) => Ok(ModelReply::Thought { text }),
            (None, None) => Err(ModelError::Malformed("reply has neither text nor a function call".into())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model is not configured: {0}")]
    NotConfigured(&'static str),
    #[error("invalid model endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("model request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("model request timed out after {0:?}")]
    Timeout(Duration),
    #[error("model API error ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("malformed model response: {0}")]
    Malformed(String),
    #[error("failed to attach image: {0}")]
    Image(#[from] ImageStoreError),
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Transport(_) | ModelError::Timeout(_) | ModelError::Malformed(_) => true,
            ModelError::Status { status, .. } => *status == 429 || *status >= 500,
            ModelError::NotConfigured(_) | ModelError::Endpoint(_) | ModelError::Image(_) => false,
        }
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, req: &ModelRequest<'_>) -> Result<ModelReply, ModelError>;
}

// Gemini `generateContent` wire types.

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeminiContent {
    pub role: String,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum GeminiPart {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thought: Option<bool>,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCallData,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponseData,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineDataContent,
    },
    /// Part kinds this client does not use (code execution and the like).
    Other(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCallData {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionResponseData {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineDataContent {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    system_instruction: Value,
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

const ZOOM_FOLLOWUP: &str = "Here is the zoomed view.";

fn inline_part(image: &ImageReference) -> Result<GeminiPart, ModelError> {
    let inline = InlineImage::load(image)?;
    Ok(GeminiPart::InlineData {
        inline_data: InlineDataContent {
            mime_type: inline.mime_type,
            data: base64::engine::general_purpose::STANDARD.encode(inline.bytes),
        },
    })
}

fn text_part(text: impl Into<String>) -> GeminiPart {
    GeminiPart::Text { text: text.into(), thought: None }
}

/// Convert the session history into Gemini contents. Tool results travel in
/// the `user` role, and consecutive same-role turns are merged because the
/// API requires alternation.
pub fn history_to_contents(history: &[Turn]) -> Result<Vec<GeminiContent>, ModelError> {
    let mut out: Vec<GeminiContent> = Vec::new();
    for turn in history {
        let (role, parts) = match (&turn.role, &turn.content) {
            (_, TurnContent::ImagePrompt { image, text }) => ("user", vec![inline_part(image)?, text_part(text)]),
            (Role::Model, TurnContent::Text { text }) => ("model", vec![text_part(text)]),
            (_, TurnContent::Text { text }) => ("user", vec![text_part(text)]),
            (_, TurnContent::ToolCall { reasoning, request }) => {
                let mut parts = Vec::new();
                if let Some(r) = reasoning {
                    parts.push(text_part(r));
                }
                parts.push(GeminiPart::FunctionCall {
                    function_call: FunctionCallData { name: request.name.clone(), args: request.args.clone() },
                });
                ("model", parts)
            }
            (_, TurnContent::ToolResult { result }) => {
                let mut parts = vec![GeminiPart::FunctionResponse {
                    function_response: FunctionResponseData {
                        name: result.tool.clone(),
                        response: json!({ "result": result.payload.text(), "ok": result.ok }),
                    },
                }];
                if let ToolPayload::Image { image, .. } = &result.payload {
                    parts.push(inline_part(image)?);
                    parts.push(text_part(ZOOM_FOLLOWUP));
                }
                ("user", parts)
            }
        };
        match out.last_mut() {
            Some(last) if last.role == role => last.parts.extend(parts),
            _ => out.push(GeminiContent { role: role.to_string(), parts }),
        }
    }
    Ok(out)
}

/// Pull the visible text and the first function call out of reply parts.
pub fn reply_from_parts(parts: Vec<GeminiPart>) -> Result<ModelReply, ModelError> {
    let mut texts = Vec::new();
    let mut call = None;
    for part in parts {
        match part {
            GeminiPart::Text { thought: Some(true), .. } => {}
            GeminiPart::Text { text, .. } => texts.push(text),
            GeminiPart::FunctionCall { function_call } if call.is_none() => {
                call = Some(ToolCallRequest::new(function_call.name, function_call.args));
            }
            _ => {}
        }
    }
    let text = (!texts.is_empty()).then(|| texts.join("\n"));
    ModelReply::classify(text, call)
}

#[derive(Clone)]
pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder().timeout(timeout).build().unwrap_or_default();
        Self { client, base_url: base_url.into(), api_key, timeout }
    }

    fn endpoint(&self, model: &str) -> Result<url::Url, ModelError> {
        let raw = format!("{}/models/{}:generateContent", self.base_url.trim_end_matches('/'), model);
        Ok(url::Url::parse(&raw)?)
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, req: &ModelRequest<'_>) -> Result<ModelReply, ModelError> {
        let key = self.api_key.as_deref().ok_or(ModelError::NotConfigured("GEMINI_API_KEY is not set"))?;
        let tools = if req.tools.is_empty() {
            Vec::new()
        } else {
            vec![json!({ "functionDeclarations": req.tools })]
        };
        let p = req.params;
        let generation_config = (p.temperature.is_some() || p.top_p.is_some() || p.max_tokens.is_some()).then(|| {
            GenerationConfig { temperature: p.temperature, top_p: p.top_p, max_output_tokens: p.max_tokens }
        });
        let body = GenerateContentRequest {
            system_instruction: json!({ "parts": [{ "text": req.system_instruction }] }),
            contents: history_to_contents(req.history)?,
            tools,
            generation_config,
        };

        let resp = self
            .client
            .post(self.endpoint(req.model)?)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Status { status: status.as_u16(), body });
        }
        let raw = resp.text().await.map_err(|e| self.transport_error(e))?;
        let parsed: GenerateContentResponse =
            serde_json::from_str(&raw).map_err(|e| ModelError::Malformed(format!("invalid JSON: {e}")))?;

        let Some(candidate) = parsed.candidates.into_iter().next() else {
            let why = parsed.prompt_feedback.map(|f| f.to_string()).unwrap_or_else(|| "no candidates".into());
            return Err(ModelError::Malformed(why));
        };
        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        if parts.is_empty() {
            let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".into());
            return Err(ModelError::Malformed(format!("empty candidate (finish reason {reason})")));
        }
        reply_from_parts(parts)
    }
}

impl GeminiClient {
    fn transport_error(&self, e: reqwest::Error) -> ModelError {
        if e.is_timeout() { ModelError::Timeout(self.timeout) } else { ModelError::Transport(e) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_store::tests::gradient_image;
    use crate::image_store::ImageStore;
    use crate::session::ToolResult;
    use axum::{routing::post, Json, Router};
    use std::sync::{Arc, Mutex};

    #[test]
    fn classify_prefers_final_marker() {
        let call = ToolCallRequest::new("web_search", json!({"query": "x"}));
        let reply = ModelReply::classify(Some("Done. [STOP]".into()), Some(call)).unwrap();
        assert!(matches!(reply, ModelReply::Final { .. }));
    }

    #[test]
    fn classify_tool_call_keeps_reasoning() {
        let call = ToolCallRequest::new("crop_image", json!({}));
        let reply = ModelReply::classify(Some("Zooming on the sign.".into()), Some(call.clone())).unwrap();
        assert_eq!(reply, ModelReply::ToolCall { request: call, reasoning: Some("Zooming on the sign.".into()) });
    }

    #[test]
    fn classify_plain_text_is_thought() {
        let reply = ModelReply::classify(Some("  The script is Tamil. ".into()), None).unwrap();
        assert_eq!(reply, ModelReply::Thought { text: "The script is Tamil.".into() });
    }

    #[test]
    fn classify_empty_is_malformed() {
        assert!(matches!(ModelReply::classify(Some("  ".into()), None), Err(ModelError::Malformed(_))));
        let unnamed = ToolCallRequest::new(" ", json!({}));
        assert!(matches!(ModelReply::classify(None, Some(unnamed)), Err(ModelError::Malformed(_))));
    }

    #[test]
    fn parts_skip_thoughts_and_take_first_call() {
        let parts: Vec<GeminiPart> = serde_json::from_value(json!([
            {"text": "hidden", "thought": true},
            {"text": "visible"},
            {"functionCall": {"name": "web_search", "args": {"query": "a"}}},
            {"functionCall": {"name": "crop_image", "args": {}}},
            {"executableCode": {"code": "print(1)"}}
        ]))
        .unwrap();
        match reply_from_parts(parts).unwrap() {
            ModelReply::ToolCall { request, reasoning } => {
                assert_eq!(request.name, "web_search");
                assert_eq!(reasoning.as_deref(), Some("visible"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn history_merges_roles_and_attaches_images() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        let img = gradient_image(&store, "a.png", 4, 4);
        let history = vec![
            Turn::new(Role::User, TurnContent::ImagePrompt { image: img.clone(), text: "Geolocate".into() }),
            Turn::new(Role::Model, TurnContent::ToolCall {
                reasoning: None,
                request: ToolCallRequest::new("crop_image", json!({"region": {"x": 0, "y": 0, "w": 2, "h": 2}})),
            }),
            Turn::new(Role::Tool, TurnContent::ToolResult {
                result: ToolResult::success("crop_image", ToolPayload::Image { image: img, text: "cropped".into() }),
            }),
            Turn::new(Role::User, TurnContent::Text { text: "Proceed.".into() }),
        ];
        let contents = history_to_contents(&history).unwrap();
        let roles: Vec<&str> = contents.iter().map(|c| c.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
        let v = serde_json::to_value(&contents).unwrap();
        assert_eq!(v[0]["parts"][0]["inlineData"]["mimeType"], "image/png");
        assert_eq!(v[1]["parts"][0]["functionCall"]["name"], "crop_image");
        assert_eq!(v[2]["parts"][0]["functionResponse"]["response"]["result"], "cropped");
        assert!(v[2]["parts"][1]["inlineData"]["data"].is_string());
        assert_eq!(v[2]["parts"][2]["text"], ZOOM_FOLLOWUP);
        assert_eq!(v[2]["parts"][3]["text"], "Proceed.");
    }

    async fn mock_gemini(reply: Value, status: u16) -> (String, Arc<Mutex<Option<Value>>>) {
        let seen = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        let app = Router::new().route(
            "/models/:action",
            post(move |Json(body): Json<Value>| {
                let seen = seen_in.clone();
                let reply = reply.clone();
                async move {
                    *seen.lock().unwrap() = Some(body);
                    (axum::http::StatusCode::from_u16(status).unwrap(), Json(reply))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    fn request<'a>(tools: &'a [ToolDeclaration], params: &'a ModelParams, history: &'a [Turn]) -> ModelRequest<'a> {
        ModelRequest { model: "gemini-test", system_instruction: "be precise", tools, params, history }
    }

    #[tokio::test]
    async fn generate_sends_declarations_and_parses_call() {
        let (base, seen) = mock_gemini(
            json!({"candidates": [{"content": {"parts": [
                {"functionCall": {"name": "web_search", "args": {"query": "Chez Pierre"}}}
            ]}}]}),
            200,
        )
        .await;
        let client = GeminiClient::new(base, Some("k".into()), Duration::from_secs(5));
        let tools = vec![ToolDeclaration {
            name: "web_search".into(),
            description: "search".into(),
            parameters: json!({"type": "object"}),
        }];
        let params = ModelParams { temperature: Some(0.4), ..Default::default() };
        let history = vec![Turn::new(Role::User, TurnContent::Text { text: "hi".into() })];
        let reply = client.generate(&request(&tools, &params, &history)).await.unwrap();
        assert!(matches!(reply, ModelReply::ToolCall { ref request, .. } if request.name == "web_search"));

        let body = seen.lock().unwrap().clone().unwrap();
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "web_search");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be precise");
        let temperature = body["generationConfig"]["temperature"].as_f64().unwrap();
        assert!((temperature - 0.4).abs() < 1e-6);
        assert_eq!(body["contents"][0]["role"], "user");
    }

    #[tokio::test]
    async fn generate_maps_status_and_empty_candidates() {
        let (base, _) = mock_gemini(json!({"error": "overloaded"}), 503).await;
        let client = GeminiClient::new(base, Some("k".into()), Duration::from_secs(5));
        let params = ModelParams::default();
        let err = client.generate(&request(&[], &params, &[])).await.unwrap_err();
        assert!(matches!(err, ModelError::Status { status: 503, .. }));
        assert!(err.is_retryable());

        let (base, _) = mock_gemini(json!({"candidates": []}), 200).await;
        let client = GeminiClient::new(base, Some("k".into()), Duration::from_secs(5));
        let err = client.generate(&request(&[], &params, &[])).await.unwrap_err();
        assert!(matches!(err, ModelError::Malformed(_)));
    }

    #[tokio::test]
    async fn generate_without_key_is_not_retryable() {
        let client = GeminiClient::new("http://127.0.0.1:9", None, Duration::from_secs(1));
        let params = ModelParams::default();
        let err = client.generate(&request(&[], &params, &[])).await.unwrap_err();
        assert!(matches!(err, ModelError::NotConfigured(_)));
        assert!(!err.is_retryable());
    }
}

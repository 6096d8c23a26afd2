//! Gemini REST client.

use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chatbot::backend::{
    Backend, BackendError, BackendResponse, GenerateConfig, Part, Tool,
};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WirePart<'a> {
    Text {
        text: &'a str,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData<'a>,
    },
}

#[derive(Serialize)]
struct InlineData<'a> {
    #[serde(rename = "mimeType")]
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    #[serde(rename = "thinkingConfig", skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Serialize)]
struct ThinkingConfig {
    #[serde(rename = "thinkingBudget")]
    thinking_budget: i32,
}

#[derive(Serialize)]
struct ToolSpec {
    #[serde(rename = "googleSearch")]
    google_search: GoogleSearch,
}

#[derive(Serialize)]
struct GoogleSearch {}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
    /// Thought summaries are not part of the answer.
    #[serde(default)]
    thought: bool,
}

#[derive(Deserialize, Debug)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize, Debug)]
struct ListModelsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ModelInfo {
    name: String,
}

impl GeminiClient {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {e}"))?;

        Ok(Self {
            api_key,
            base_url: GEMINI_API_URL.to_string(),
            client,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, BackendError> {
        let response = request
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Http(format!("Failed to read response: {e}")))?;

        debug!("Gemini response status: {status}");

        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &body));
        }
        Ok(body)
    }
}

impl Backend for GeminiClient {
    async fn generate_content(
        &self,
        model: &str,
        contents: &[Part],
        config: &GenerateConfig,
    ) -> Result<BackendResponse, BackendError> {
        let request = build_request(contents, config);
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url,
            urlencoding::encode(model)
        );

        info!("🤖 Gemini request to {model} ({} part(s))", contents.len());
        let body = self.send(self.client.post(&url).json(&request)).await?;

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| BackendError::Parse(format!("Failed to parse response: {e}")))?;

        Ok(BackendResponse {
            text: extract_text(parsed),
        })
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!("{}/models?pageSize=1000", self.base_url);
            if let Some(ref token) = page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }

            let body = self.send(self.client.get(&url)).await?;
            let page: ListModelsResponse = serde_json::from_str(&body)
                .map_err(|e| BackendError::Parse(format!("Failed to parse model list: {e}")))?;

            names.extend(page.models.into_iter().map(|m| {
                m.name
                    .strip_prefix("models/")
                    .map(str::to_string)
                    .unwrap_or(m.name)
            }));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(names)
    }
}

fn build_request<'a>(contents: &'a [Part], config: &'a GenerateConfig) -> GenerateRequest<'a> {
    let parts = contents.iter().map(wire_part).collect();

    let system_instruction = config.system_instruction.as_deref().map(|text| SystemInstruction {
        parts: vec![WirePart::Text { text }],
    });

    let response_mime_type = config.json_response.then_some("application/json");
    let generation_config = if config.thinking_budget.is_some() || response_mime_type.is_some() {
        Some(GenerationConfig {
            thinking_config: config.thinking_budget.map(|thinking_budget| ThinkingConfig {
                thinking_budget,
            }),
            response_mime_type,
        })
    } else {
        None
    };

    let tools = config
        .tools
        .iter()
        .map(|tool| match tool {
            Tool::GoogleSearch => ToolSpec {
                google_search: GoogleSearch {},
            },
        })
        .collect();

    GenerateRequest {
        contents: vec![Content {
            role: "user",
            parts,
        }],
        system_instruction,
        generation_config,
        tools,
    }
}

fn wire_part(part: &Part) -> WirePart<'_> {
    match part {
        Part::Text(text) => WirePart::Text { text },
        Part::InlineData { mime_type, data } => WirePart::Inline {
            inline_data: InlineData {
                mime_type,
                data: base64::engine::general_purpose::STANDARD.encode(data),
            },
        },
    }
}

fn extract_text(response: GenerateResponse) -> String {
    response
        .candidates
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter(|p| !p.thought)
                .filter_map(|p| p.text)
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Map a non-2xx response to an error class.
fn classify_error(status: u16, body: &str) -> BackendError {
    let (api_status, message) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => (env.error.status, env.error.message),
        Err(_) => (String::new(), body.to_string()),
    };

    if status == 404 || api_status == "NOT_FOUND" {
        BackendError::NotFound(message)
    } else if status == 429 || api_status == "RESOURCE_EXHAUSTED" {
        BackendError::ResourceExhausted(message)
    } else {
        BackendError::Api { status, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_quota() {
        let body = r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(
            classify_error(429, body),
            BackendError::ResourceExhausted("Quota exceeded".to_string())
        );
    }

    #[test]
    fn test_classify_not_found() {
        let body = r#"{"error":{"code":404,"message":"models/foo is not found","status":"NOT_FOUND"}}"#;
        assert!(classify_error(404, body).is_not_found());
    }

    #[test]
    fn test_classify_by_status_name() {
        let body = r#"{"error":{"code":400,"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#;
        assert!(classify_error(400, body).is_resource_exhausted());
    }

    #[test]
    fn test_classify_other() {
        let err = classify_error(500, "internal");
        assert_eq!(
            err,
            BackendError::Api {
                status: 500,
                message: "internal".to_string()
            }
        );
    }

    #[test]
    fn test_request_serialization() {
        let contents = vec![Part::inline("audio/ogg", vec![1, 2, 3]), Part::text("Transcribe")];
        let config = GenerateConfig {
            system_instruction: Some("be brief".to_string()),
            thinking_budget: Some(0),
            tools: vec![Tool::GoogleSearch],
            json_response: false,
        };

        let json = serde_json::to_value(build_request(&contents, &config)).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["inlineData"]["mimeType"], "audio/ogg");
        assert_eq!(json["contents"][0]["parts"][0]["inlineData"]["data"], "AQID");
        assert_eq!(json["contents"][0]["parts"][1]["text"], "Transcribe");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(json["generationConfig"]["thinkingConfig"]["thinkingBudget"], 0);
        assert_eq!(json["tools"][0]["googleSearch"], serde_json::json!({}));
    }

    #[test]
    fn test_minimal_request_omits_optional_fields() {
        let contents = vec![Part::text("hi")];
        let json = serde_json::to_value(build_request(&contents, &GenerateConfig::default())).unwrap();
        assert!(json.get("systemInstruction").is_none());
        assert!(json.get("generationConfig").is_none());
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn test_extract_text_skips_thoughts() {
        let body = r#"{"candidates":[{"content":{"parts":[
            {"text":"thinking...","thought":true},
            {"text":"Hello "},
            {"text":"there"}
        ]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(extract_text(parsed), "Hello there");
    }

    #[test]
    fn test_extract_text_empty() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert_eq!(extract_text(parsed), "");
        let parsed: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(extract_text(parsed), "");
    }
}

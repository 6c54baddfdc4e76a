//! Minimal Gemini REST client.
//!
//! Three call shapes cover the pipeline: plain text generation, generation
//! against a response schema (structured extraction), and search-grounded
//! generation (the discover phase). Cost is computed from token usage and
//! attached to every response so phases can account for spend.

mod cost;
mod error;

pub use cost::cost_usd;
pub use error::{LlmError, Result};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct GroundedResponse {
    pub text: String,
    /// (uri, title) pairs from the grounding metadata, in citation order.
    pub sources: Vec<(String, String)>,
    pub cost_usd: f64,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .map_err(|_| LlmError::Config("GOOGLE_API_KEY not set".into()))?;
        Ok(Self::new(api_key, model, Duration::from_secs(120)))
    }

    /// Point at a different endpoint (tests, proxies).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn generate(&self, system: Option<&str>, prompt: &str) -> Result<LlmResponse> {
        let request = GenerateRequest {
            contents: vec![Content::user(prompt)],
            system_instruction: system.map(Content::bare),
            generation_config: None,
            tools: None,
        };
        let response = self.call(&request).await?;
        self.into_text_response(response)
    }

    /// Generate against a response schema. The schema is Gemini's OpenAPI
    /// subset; the model is forced to emit JSON matching it.
    pub async fn generate_json(
        &self,
        system: Option<&str>,
        prompt: &str,
        schema: Value,
    ) -> Result<(Value, LlmResponse)> {
        let request = GenerateRequest {
            contents: vec![Content::user(prompt)],
            system_instruction: system.map(Content::bare),
            generation_config: Some(GenerationConfig {
                response_mime_type: Some("application/json".into()),
                response_schema: Some(schema),
                temperature: Some(0.1),
            }),
            tools: None,
        };
        let response = self.call(&request).await?;
        let text_response = self.into_text_response(response)?;
        let value: Value = serde_json::from_str(text_response.text.trim())
            .map_err(|e| LlmError::UnparseableJson(format!("{e}: {}", truncate(&text_response.text))))?;
        Ok((value, text_response))
    }

    /// Search-grounded generation: the model may issue web searches and the
    /// response carries the grounding sources it used.
    pub async fn generate_grounded(&self, prompt: &str) -> Result<GroundedResponse> {
        let request = GenerateRequest {
            contents: vec![Content::user(prompt)],
            system_instruction: None,
            generation_config: None,
            tools: Some(vec![Tool { google_search: Some(Value::Object(Default::default())) }]),
        };
        let response = self.call(&request).await?;

        let usage = response.usage_metadata.clone().unwrap_or_default();
        let candidate = response.candidates.into_iter().next().ok_or(LlmError::Empty)?;
        let sources = candidate
            .grounding_metadata
            .map(|g| {
                g.grounding_chunks
                    .into_iter()
                    .filter_map(|c| c.web.map(|w| (w.uri, w.title.unwrap_or_default())))
                    .collect()
            })
            .unwrap_or_default();
        let text = candidate_text(candidate.content).ok_or(LlmError::Empty)?;
        let cost = cost_usd(&self.model, usage.prompt_token_count, usage.candidates_token_count);
        Ok(GroundedResponse { text, sources, cost_usd: cost })
    }

    async fn call(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        debug!(model = %self.model, "gemini request");
        let response = self.http.post(&url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status: status.as_u16(), message: truncate(&message) });
        }
        Ok(response.json().await?)
    }

    fn into_text_response(&self, response: GenerateResponse) -> Result<LlmResponse> {
        let usage = response.usage_metadata.unwrap_or_default();
        let text = response
            .candidates
            .into_iter()
            .next()
            .and_then(|c| candidate_text(c.content))
            .ok_or(LlmError::Empty)?;
        let cost = cost_usd(&self.model, usage.prompt_token_count, usage.candidates_token_count);
        Ok(LlmResponse {
            text,
            prompt_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            cost_usd: cost,
        })
    }
}

fn candidate_text(content: Option<Content>) -> Option<String> {
    let parts = content?.parts;
    let text: String = parts.into_iter().filter_map(|p| p.text).collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn truncate(s: &str) -> String {
    const MAX: usize = 300;
    if s.len() <= MAX {
        s.to_string()
    } else {
        let mut end = MAX;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

// === wire types ===

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn user(text: &str) -> Self {
        Self { role: Some("user".into()), parts: vec![Part { text: Some(text.into()) }] }
    }

    fn bare(text: &str) -> Self {
        Self { role: None, parts: vec![Part { text: Some(text.into()) }] }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    #[serde(skip_serializing_if = "Option::is_none")]
    google_search: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    uri: String,
    title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_parses_text_and_usage() {
        let raw = r#"{
            "candidates": [{"content": {"role": "model", "parts": [{"text": "hello"}]}}],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 2}
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let usage = parsed.usage_metadata.unwrap();
        assert_eq!(usage.prompt_token_count, 10);
        assert_eq!(
            candidate_text(parsed.candidates.into_iter().next().unwrap().content).unwrap(),
            "hello"
        );
    }

    #[test]
    fn grounding_sources_parse() {
        let raw = r#"{
            "candidates": [{
                "content": {"parts": [{"text": "answer"}]},
                "groundingMetadata": {"groundingChunks": [
                    {"web": {"uri": "https://example.org/a", "title": "A"}},
                    {"web": {"uri": "https://example.org/b"}}
                ]}
            }]
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let candidate = parsed.candidates.into_iter().next().unwrap();
        let chunks = candidate.grounding_metadata.unwrap().grounding_chunks;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].web.as_ref().unwrap().uri, "https://example.org/a");
    }

    #[test]
    fn empty_candidates_is_an_error() {
        let client = GeminiClient::new("k", "gemini-2.5-flash", Duration::from_secs(5));
        let response = GenerateResponse { candidates: vec![], usage_metadata: None };
        assert!(matches!(client.into_text_response(response), Err(LlmError::Empty)));
    }
}

use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};

use crate::chat::{ChatError, LanguageModel};
use crate::config::GeminiConfig;

const SYSTEM_INSTRUCTION: &str = "You are Vision, a friendly and knowledgeable financial advisor having a natural conversation. \
Continue the conversation below. Give warm, practical answers with specific examples and actionable steps. \
When discussing investments, mention market context and risks. Use Markdown **bold** or *italic* for emphasis. \
If something is outside your expertise, say so instead of guessing.";

pub struct GeminiClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> anyhow::Result<Self> {
        Ok(GeminiClient {
            http: ClientBuilder::new()
                .connect_timeout(Duration::from_secs(5))
                .read_timeout(Duration::from_secs(60))
                .timeout(Duration::from_secs(90))
                .build()?,
            base_url: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate_content(&self, prompt: &str) -> Result<String, ChatError> {
        let api_key = self.api_key.as_deref().ok_or(ChatError::MissingCredential)?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let request = GenerateContentRequest::new(SYSTEM_INSTRUCTION, prompt);
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| ChatError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ChatError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(ChatError::Model(error_detail(status.as_u16(), &body)));
        }
        extract_text(&body)
    }
}

impl LanguageModel for GeminiClient {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, ChatError>> {
        Box::pin(self.generate_content(prompt))
    }
}

fn extract_text(body: &str) -> Result<String, ChatError> {
    let response: GenerateContentResponse = serde_json::from_str(body)
        .map_err(|err| ChatError::Model(format!("unreadable response: {err}")))?;
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or(ChatError::EmptyResponse)?;
    let text = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        Err(ChatError::EmptyResponse)
    } else {
        Ok(trimmed.to_string())
    }
}

fn error_detail(status: u16, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => format!("{status} {}", envelope.error.message),
        Err(_) if body.trim().is_empty() => status.to_string(),
        Err(_) => format!("{status} {}", body.trim()),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

impl GenerateContentRequest {
    fn new(system: &str, prompt: &str) -> Self {
        GenerateContentRequest {
            system_instruction: Content {
                role: None,
                parts: vec![Part::text(system)],
            },
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(prompt)],
            }],
            generation_config: GenerationConfig { temperature: 0.7 },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

impl Part {
    fn text(value: &str) -> Self {
        Part {
            text: Some(value.to_string()),
        }
    }
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

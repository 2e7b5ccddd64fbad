//! Minimal client for OpenAI-compatible HTTP APIs.
//!
//! Gemini, Ollama, llama.cpp and vLLM all expose `/chat/completions` and
//! `/embeddings` in this shape, so one client covers every remote backend.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

pub const API_KEY_ENV_VAR: &str = "DOCUBOT_API_KEY";

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    service: &'static str,
}

impl OpenAiClient {
    /// `service` names the collaborator in error messages ("answerer",
    /// "embedder").
    pub fn new(
        service: &'static str,
        base_url: &str,
        api_key: Option<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().build().map_err(|e| {
            Error::Config(format!("failed to build HTTP client: {e}"))
        })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            service,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self.http.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            // Connection and timeout failures are worth another attempt.
            Error::external(self.service, e.to_string(), true)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::external(
                self.service,
                format!("{url} returned {status}: {}", body.trim()),
                is_retryable_status(status),
            ));
        }

        response.json::<T>().await.map_err(|e| {
            Error::external(
                self.service,
                format!("invalid response from {url}: {e}"),
                false,
            )
        })
    }

    /// Single-turn chat completion returning the first choice's text.
    pub async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        json_mode: bool,
    ) -> Result<String> {
        let request = ChatRequest {
            model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            response_format: json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response: ChatResponse =
            self.post_json("chat/completions", &request).await?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                Error::external(self.service, "response had no choices", true)
            })
    }

    /// Embed a batch of texts, returned in input order.
    pub async fn embeddings(
        &self,
        model: &str,
        input: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let request = EmbeddingRequest { model, input };
        let mut response: EmbeddingResponse =
            self.post_json("embeddings", &request).await?;

        if response.data.len() != input.len() {
            return Err(Error::external(
                self.service,
                format!(
                    "expected {} embeddings, got {}",
                    input.len(),
                    response.data.len()
                ),
                false,
            ));
        }
        response.data.sort_by_key(|d| d.index);
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

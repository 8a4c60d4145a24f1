//! OpenAI-compatible streaming client.
//!
//! Speaks `POST {endpoint}/chat/completions` with `stream: true` and decodes the
//! server-sent event body into token deltas.

use crate::cancel::CancelToken;
use crate::error::ProviderError;
use crate::provider::{ChatMessage, GenerationParams, GenerationProvider, TokenStream};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

const PROVIDER_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    user: &'a str,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

fn map_http_error(error: reqwest::Error) -> ProviderError {
    if let Some(status) = error.status() {
        ProviderError::from_status(status.as_u16(), &error.to_string())
    } else if error.is_timeout() {
        ProviderError::timeout(format!("Request timeout: {}", error))
    } else if error.is_connect() || error.is_request() || error.is_body() {
        ProviderError::network(format!("Connection error: {}", error))
    } else {
        ProviderError::unknown(format!("HTTP error: {}", error))
    }
}

pub struct OpenAiCompatibleClient {
    client: Client,
    name: String,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleClient {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        // Whole-call deadlines belong to the retry policy; only connects are bounded here.
        let client = Client::builder()
            .connect_timeout(PROVIDER_HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::unknown(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            name: name.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAiCompatibleClient {
    async fn submit(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
        _cancel: &CancelToken,
    ) -> Result<TokenStream, ProviderError> {
        let request = ChatCompletionRequest {
            model: &params.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            stream: true,
            user: &params.unit_id,
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(map_http_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::from_status(status, &body));
        }

        debug!(unit_id = %params.unit_id, url = %url, "Provider stream opened");
        Ok(decode_event_stream(response.bytes_stream().map(|chunk| {
            chunk.map(|bytes| bytes.to_vec()).map_err(map_http_error)
        })))
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}

/// Outcome of decoding one `data:` line.
enum SseLine {
    Tokens(Vec<String>),
    Done,
    Skip,
}

fn decode_line(line: &str) -> Result<SseLine, ProviderError> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(SseLine::Skip);
    }
    if payload == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let chunk: ChunkResponse = serde_json::from_str(payload)
        .map_err(|e| ProviderError::unknown(format!("Malformed stream chunk: {}", e)))?;
    Ok(SseLine::Tokens(
        chunk
            .choices
            .into_iter()
            .filter_map(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .collect(),
    ))
}

struct DecoderState<S> {
    body: S,
    buffer: Vec<u8>,
    ready: VecDeque<Result<String, ProviderError>>,
    finished: bool,
}

/// Turn a raw SSE byte stream into token deltas. Chunk boundaries may split lines.
pub(crate) fn decode_event_stream<S>(body: S) -> TokenStream
where
    S: futures::Stream<Item = Result<Vec<u8>, ProviderError>> + Send + Unpin + 'static,
{
    let state = DecoderState {
        body,
        buffer: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    while let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                        let raw: Vec<u8> = state.buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&raw);
                        match decode_line(line.trim_end()) {
                            Ok(SseLine::Tokens(tokens)) => {
                                state.ready.extend(tokens.into_iter().map(Ok));
                            }
                            Ok(SseLine::Done) => {
                                state.finished = true;
                                break;
                            }
                            Ok(SseLine::Skip) => {}
                            Err(err) => {
                                state.ready.push_back(Err(err));
                                state.finished = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    state.ready.push_back(Err(err));
                    state.finished = true;
                }
                None => {
                    // A body that ends without [DONE] was cut off mid-stream.
                    state.ready.push_back(Err(ProviderError::network(
                        "Stream ended before completion marker",
                    )));
                    state.finished = true;
                }
            }
        }
    }))
}

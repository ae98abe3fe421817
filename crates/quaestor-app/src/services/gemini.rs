//! Gemini File Search REST client.
//!
//! Talks to `generativelanguage.googleapis.com` directly: store creation,
//! multipart upload into a store, long-running-operation polling, a streaming
//! generation call with the `file_search` tool, and 404-tolerant deletes.
//! Every call is blocking and must run on a worker thread; the HTTP client is
//! built lazily on first use so construction never happens on the event loop.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use backon::{BlockingRetryable, ExponentialBuilder};
use serde_json::{json, Value};

use crate::config::GeminiConfig;
use crate::services::rag::{
    validate_store_handle, AskRequest, ChunkStream, GroundingChunk, GroundingInfo, OpStatus,
    RagClient, RagError, StreamChunk, UploadResult, UsageMeta,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiRag {
    api_key: String,
    base_url: String,
    http_timeout: Duration,
    retry_attempts: usize,
    http: OnceLock<reqwest::blocking::Client>,
}

impl GeminiRag {
    pub fn from_config(config: &GeminiConfig) -> Result<Self, RagError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| RagError::Malformed("gemini api key is not configured".to_string()))?;
        Ok(Self {
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            http_timeout: Duration::from_secs(config.http_timeout_s),
            retry_attempts: config.retry_attempts,
            http: OnceLock::new(),
        })
    }

    fn http(&self) -> &reqwest::blocking::Client {
        self.http.get_or_init(|| {
            reqwest::blocking::Client::builder()
                .timeout(self.http_timeout)
                .build()
                .unwrap_or_default()
        })
    }

    /// Streaming requests must not be cut off by the request timeout; slow
    /// generations routinely exceed it.
    fn http_streaming(&self) -> Result<reqwest::blocking::Client, RagError> {
        reqwest::blocking::Client::builder()
            .connect_timeout(self.http_timeout)
            .build()
            .map_err(|err| RagError::Transport(err.to_string()))
    }

    fn retry_policy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_max_times(self.retry_attempts.saturating_sub(1))
    }

    fn check_response(
        response: Result<reqwest::blocking::Response, reqwest::Error>,
    ) -> Result<reqwest::blocking::Response, RagError> {
        let response = response.map_err(classify_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .unwrap_or_default()
            .chars()
            .take(500)
            .collect();
        Err(RagError::Status {
            status: status.as_u16(),
            message,
        })
    }

    fn get_json(&self, url: &str) -> Result<Value, RagError> {
        let response = Self::check_response(self.http().get(url).send())?;
        response
            .json::<Value>()
            .map_err(|err| RagError::Malformed(err.to_string()))
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> RagError {
    if err.is_timeout() {
        RagError::Timeout(err.to_string())
    } else {
        RagError::Transport(err.to_string())
    }
}

/// Pull a `files/...` (or store-document) identifier out of an operation or
/// upload payload, trying the shapes the API has been observed to return.
fn extract_file_id(payload: &Value) -> Option<String> {
    let candidates = [
        payload.get("name"),
        payload.pointer("/file/name"),
        payload.pointer("/response/document/name"),
        payload.pointer("/response/file/name"),
        payload.pointer("/response/name"),
        payload.pointer("/metadata/file/name"),
        payload.pointer("/metadata/resourceName"),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(name) = candidate.as_str() {
            let name = name.trim();
            if name.starts_with("files/") || name.contains("/documents/") {
                return Some(name.to_string());
            }
        }
    }
    None
}

fn extract_error_message(err: &Value) -> Option<String> {
    if err.is_null() {
        return None;
    }
    if let Some(text) = err.as_str() {
        return Some(text.to_string());
    }
    for key in ["message", "msg", "error", "details"] {
        if let Some(text) = err.get(key).and_then(Value::as_str) {
            return Some(text.to_string());
        }
    }
    Some(err.to_string())
}

fn parse_op_status(payload: &Value) -> OpStatus {
    OpStatus {
        done: payload.get("done").and_then(Value::as_bool).unwrap_or(false),
        error: payload.get("error").and_then(extract_error_message),
        file_id: extract_file_id(payload),
    }
}

impl RagClient for GeminiRag {
    fn create_store(&self, display_name: &str) -> Result<String, RagError> {
        let url = format!(
            "{}/v1beta/fileSearchStores?key={}",
            self.base_url, self.api_key
        );
        let body = json!({ "displayName": display_name });
        let call = || -> Result<Value, RagError> {
            let response = Self::check_response(self.http().post(&url).json(&body).send())?;
            response
                .json::<Value>()
                .map_err(|err| RagError::Malformed(err.to_string()))
        };
        let payload = call
            .retry(self.retry_policy())
            .when(RagError::retryable)
            .call()?;
        let handle = payload
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RagError::Malformed("store creation response missing name".to_string()))?
            .to_string();
        validate_store_handle(&handle)?;
        Ok(handle)
    }

    fn upload_file(
        &self,
        store_handle: &str,
        local_path: &Path,
        display_name: &str,
    ) -> Result<UploadResult, RagError> {
        let url = format!(
            "{}/upload/v1beta/{}:uploadToFileSearchStore?key={}",
            self.base_url, store_handle, self.api_key
        );
        let metadata = json!({ "displayName": display_name }).to_string();
        let call = || -> Result<Value, RagError> {
            let file_part = reqwest::blocking::multipart::Part::file(local_path)
                .map_err(|err| RagError::Transport(err.to_string()))?;
            let metadata_part = reqwest::blocking::multipart::Part::text(metadata.clone())
                .mime_str("application/json")
                .map_err(|err| RagError::Malformed(err.to_string()))?;
            let form = reqwest::blocking::multipart::Form::new()
                .part("metadata", metadata_part)
                .part("file", file_part);
            let response =
                Self::check_response(self.http().post(&url).multipart(form).send())?;
            response
                .json::<Value>()
                .map_err(|err| RagError::Malformed(err.to_string()))
        };
        let payload = call
            .retry(self.retry_policy())
            .when(RagError::retryable)
            .call()?;

        let op_handle = payload
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| RagError::Malformed("upload response missing operation name".to_string()))?
            .to_string();
        let file_id = extract_file_id(&payload).filter(|id| id != &op_handle);
        Ok(UploadResult { op_handle, file_id })
    }

    fn op_status(&self, op_handle: &str) -> Result<OpStatus, RagError> {
        let url = format!("{}/v1beta/{}?key={}", self.base_url, op_handle, self.api_key);
        let payload = self.get_json(&url)?;
        Ok(parse_op_status(&payload))
    }

    fn ask_stream(&self, request: AskRequest) -> Result<ChunkStream, RagError> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, request.model, self.api_key
        );
        let mut file_search = json!({ "fileSearchStoreNames": request.store_handles });
        if let Some(filter) = &request.metadata_filter {
            file_search["metadataFilter"] = filter.clone();
        }
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.question }] }],
            "tools": [{ "fileSearch": file_search }],
        });
        let client = self.http_streaming()?;
        let response = Self::check_response(client.post(&url).json(&body).send())?;
        Ok(Box::new(SseChunkIter {
            reader: BufReader::new(response),
            finished: false,
        }))
    }

    fn delete_store(&self, store_handle: &str) -> Result<(), RagError> {
        let url = format!(
            "{}/v1beta/{}?force=true&key={}",
            self.base_url, store_handle, self.api_key
        );
        tolerant_delete(self.http(), &url)
    }

    fn delete_document(&self, file_id: &str) -> Result<(), RagError> {
        let url = format!("{}/v1beta/{}?key={}", self.base_url, file_id, self.api_key);
        tolerant_delete(self.http(), &url)
    }
}

/// DELETE treating 404 as success (already gone).
fn tolerant_delete(client: &reqwest::blocking::Client, url: &str) -> Result<(), RagError> {
    let response = client
        .delete(url)
        .send()
        .map_err(classify_reqwest_error)?;
    let status = response.status();
    if status.is_success() || status.as_u16() == 404 {
        return Ok(());
    }
    Err(RagError::Status {
        status: status.as_u16(),
        message: response.text().unwrap_or_default().chars().take(500).collect(),
    })
}

struct SseChunkIter<R> {
    reader: BufReader<R>,
    finished: bool,
}

impl<R: std::io::Read> SseChunkIter<R> {
    fn parse_event(payload: &Value) -> StreamChunk {
        let candidate = payload.pointer("/candidates/0");
        let mut text = String::new();
        if let Some(parts) = candidate
            .and_then(|c| c.pointer("/content/parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(fragment) = part.get("text").and_then(Value::as_str) {
                    text.push_str(fragment);
                }
            }
        }

        let grounding = candidate
            .and_then(|c| c.get("groundingMetadata"))
            .and_then(|gm| gm.get("groundingChunks"))
            .and_then(Value::as_array)
            .map(|chunks| GroundingInfo {
                chunks: chunks
                    .iter()
                    .map(|chunk| {
                        let retrieved = chunk.get("retrievedContext");
                        let web = chunk.get("web");
                        let source = retrieved.or(web).unwrap_or(&Value::Null);
                        GroundingChunk {
                            uri: source.get("uri").and_then(Value::as_str).map(String::from),
                            title: source.get("title").and_then(Value::as_str).map(String::from),
                            snippet: source.get("text").and_then(Value::as_str).map(String::from),
                            store: source
                                .get("fileSearchStore")
                                .and_then(Value::as_str)
                                .map(String::from),
                        }
                    })
                    .collect(),
            });

        let usage = payload.get("usageMetadata").map(|meta| UsageMeta {
            prompt_tokens: meta.get("promptTokenCount").and_then(Value::as_u64),
            completion_tokens: meta.get("candidatesTokenCount").and_then(Value::as_u64),
        });

        StreamChunk {
            text_delta: if text.is_empty() { None } else { Some(text) },
            grounding,
            usage,
        }
    }
}

impl<R: std::io::Read> Iterator for SseChunkIter<R> {
    type Item = Result<StreamChunk, RagError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.finished = true;
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    self.finished = true;
                    return Some(Err(RagError::Transport(err.to_string())));
                }
            }
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(payload) => return Some(Ok(Self::parse_event(&payload))),
                Err(err) => {
                    self.finished = true;
                    return Some(Err(RagError::Malformed(err.to_string())));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_status_parses_error_shapes() {
        let payload = json!({ "done": true, "error": { "message": "boom" } });
        let status = parse_op_status(&payload);
        assert!(status.done);
        assert_eq!(status.error.as_deref(), Some("boom"));

        let payload = json!({ "done": false });
        let status = parse_op_status(&payload);
        assert!(!status.done);
        assert!(status.error.is_none());
    }

    #[test]
    fn file_id_recovery_tries_known_shapes() {
        let payload = json!({ "name": "files/abc" });
        assert_eq!(extract_file_id(&payload).as_deref(), Some("files/abc"));

        let payload = json!({
            "name": "operations/op-1",
            "response": { "document": { "name": "fileSearchStores/s/documents/d1" } }
        });
        assert_eq!(
            extract_file_id(&payload).as_deref(),
            Some("fileSearchStores/s/documents/d1")
        );

        let payload = json!({ "name": "operations/op-1" });
        assert_eq!(extract_file_id(&payload), None);
    }

    #[test]
    fn sse_iterator_parses_deltas_and_usage() {
        let raw = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
            ": keepalive\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}],",
            "\"usageMetadata\":{\"promptTokenCount\":12,\"candidatesTokenCount\":3}}\n\n",
            "data: [DONE]\n\n",
        );
        let mut iter = SseChunkIter {
            reader: BufReader::new(raw.as_bytes()),
            finished: false,
        };
        let first = iter.next().expect("first").expect("ok");
        assert_eq!(first.text_delta.as_deref(), Some("Hel"));
        let second = iter.next().expect("second").expect("ok");
        assert_eq!(second.text_delta.as_deref(), Some("lo"));
        let usage = second.usage.expect("usage");
        assert_eq!(usage.prompt_tokens, Some(12));
        assert_eq!(usage.completion_tokens, Some(3));
        assert!(iter.next().is_none());
    }

    #[test]
    fn sse_iterator_extracts_grounding() {
        let raw = "data: {\"candidates\":[{\"groundingMetadata\":{\"groundingChunks\":[{\"retrievedContext\":{\"uri\":\"doc://a\",\"title\":\"A\",\"text\":\"snippet\"}}]}}]}\n\n";
        let mut iter = SseChunkIter {
            reader: BufReader::new(raw.as_bytes()),
            finished: false,
        };
        let chunk = iter.next().expect("chunk").expect("ok");
        let grounding = chunk.grounding.expect("grounding");
        assert_eq!(grounding.chunks.len(), 1);
        assert_eq!(grounding.chunks[0].uri.as_deref(), Some("doc://a"));
        assert_eq!(grounding.chunks[0].snippet.as_deref(), Some("snippet"));
    }
}

use anyhow::{Result, anyhow};
use codeagent_core::{AgentError, ChatMessage, LlmConfig};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

/// Sampling options for one chat call. `extra` is an opaque pass-through
/// map merged verbatim into the request payload.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub extra: BTreeMap<String, Value>,
}

/// Synchronous request/response transport to the model provider.
pub trait LlmClient {
    fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<String>;
}

/// OpenAI-compatible chat-completions client over blocking HTTP.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    cfg: LlmConfig,
    api_key: String,
    client: Client,
}

impl HttpLlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env)
            .map_err(|_| anyhow!("environment variable {} is not set", cfg.api_key_env))?;
        Self::with_api_key(cfg, api_key)
    }

    pub fn with_api_key(cfg: LlmConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            cfg,
            api_key,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        )
    }
}

impl LlmClient for HttpLlmClient {
    fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<String> {
        let payload = build_payload(&self.cfg, messages, options);
        let endpoint = self.endpoint();

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&endpoint)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text()?;
                    if status.is_success() {
                        return extract_reply_text(&body);
                    }
                    last_err = Some(
                        AgentError::Provider {
                            status: Some(status.as_u16()),
                            detail: truncate(&body, 600),
                        }
                        .into(),
                    );
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(self.cfg.retry_base_ms, attempt));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(
                        AgentError::Provider {
                            status: None,
                            detail: e.to_string(),
                        }
                        .into(),
                    );
                    if attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(self.cfg.retry_base_ms, attempt));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("llm request failed without detailed error")))
    }
}

fn build_payload(cfg: &LlmConfig, messages: &[ChatMessage], options: &ChatOptions) -> Value {
    let rendered: Vec<Value> = messages
        .iter()
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect();
    let mut payload = json!({
        "model": cfg.model,
        "messages": rendered,
        "temperature": options.temperature.unwrap_or(cfg.temperature),
        "stream": false,
    });
    for (key, value) in &options.extra {
        payload[key] = value.clone();
    }
    payload
}

fn extract_reply_text(body: &str) -> Result<String> {
    let value: Value = serde_json::from_str(body).map_err(|e| AgentError::Provider {
        status: None,
        detail: format!("unparsable provider response: {e}"),
    })?;
    value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            AgentError::Provider {
                status: None,
                detail: "provider response missing choices[0].message.content".to_string(),
            }
            .into()
        })
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_delay(base_ms: u64, attempt: u8) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1 << attempt.min(6)))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn serve_once(response_body: &'static str, status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = vec![0_u8; 16384];
            let _ = stream.read(&mut buf).expect("read request");
            let reply = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
                response_body.len()
            );
            let _ = stream.write_all(reply.as_bytes());
        });
        format!("http://{addr}")
    }

    fn test_cfg(base_url: String) -> LlmConfig {
        LlmConfig {
            base_url,
            max_retries: 0,
            timeout_seconds: 5,
            ..LlmConfig::default()
        }
    }

    #[test]
    fn chat_extracts_reply_text() {
        let base_url = serve_once(
            r#"{"choices":[{"message":{"role":"assistant","content":"hello there"}}]}"#,
            "HTTP/1.1 200 OK",
        );
        let client =
            HttpLlmClient::with_api_key(test_cfg(base_url), "test-key".to_string()).expect("client");
        let reply = client
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .expect("chat");
        assert_eq!(reply, "hello there");
    }

    #[test]
    fn provider_error_carries_status_and_detail() {
        let base_url = serve_once(r#"{"error":"no capacity"}"#, "HTTP/1.1 503 Service Unavailable");
        let client =
            HttpLlmClient::with_api_key(test_cfg(base_url), "test-key".to_string()).expect("client");
        let err = client
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .expect_err("should fail");
        let provider = err.downcast_ref::<AgentError>().expect("agent error");
        match provider {
            AgentError::Provider { status, detail } => {
                assert_eq!(*status, Some(503));
                assert!(detail.contains("no capacity"));
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn payload_merges_temperature_and_extra_options() {
        let cfg = LlmConfig::default();
        let options = ChatOptions {
            temperature: Some(0.4),
            extra: BTreeMap::from([("max_tokens".to_string(), json!(128))]),
        };
        let payload = build_payload(&cfg, &[ChatMessage::system("s")], &options);
        assert_eq!(payload["temperature"], json!(0.4));
        assert_eq!(payload["max_tokens"], json!(128));
        assert_eq!(payload["messages"][0]["role"], "system");
    }

    #[test]
    fn missing_content_is_a_provider_error() {
        let err = extract_reply_text(r#"{"choices":[]}"#).expect_err("should fail");
        assert!(err.to_string().contains("choices[0].message.content"));
    }
}

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{SpeechRequest, SpeechSynthesizer, VoiceSettings};
use crate::config::SpeechConfig;

/// Synthesis provider speaking the `/v1/tts` + `/v1/tasks/{id}` protocol.
#[derive(Debug, Clone)]
pub struct HttpSpeechClient {
    http: Client,
    base: Url,
    api_key: Option<String>,
    poll_interval: Duration,
    max_polls: u32,
}

#[derive(Debug, Serialize)]
struct TtsBody<'a> {
    voice_id: &'a str,
    text: &'a str,
    voice_settings: &'a VoiceSettings,
}

#[derive(Debug, Deserialize)]
struct TaskCreated {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    audio_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, PartialEq)]
enum PollOutcome {
    Pending,
    Done(String),
}

impl HttpSpeechClient {
    pub fn new(config: &SpeechConfig, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("failed to build speech HTTP client")?;
        // A trailing slash keeps `join` from replacing the last path segment.
        let mut base = config.base_url.trim_end_matches('/').to_owned();
        base.push('/');
        let base = Url::parse(&base)
            .with_context(|| format!("invalid speech base url '{}'", config.base_url))?;
        Ok(Self {
            http,
            base,
            api_key,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("failed to build speech endpoint '{path}'"))
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn poll_task(&self, task_id: &str) -> Result<String> {
        let url = self.endpoint(&format!("v1/tasks/{task_id}"))?;
        for attempt in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;
            let status: TaskStatus = self
                .authorized(self.http.get(url.clone()))
                .send()
                .await
                .context("failed to poll speech task")?
                .error_for_status()
                .context("speech task endpoint returned an error status")?
                .json()
                .await
                .context("failed to decode speech task status")?;
            match interpret_status(status)? {
                PollOutcome::Done(audio_url) => return Ok(audio_url),
                PollOutcome::Pending => {
                    tracing::debug!(task_id, attempt, "speech task still pending");
                }
            }
        }
        bail!(
            "speech task {task_id} did not finish after {} polls",
            self.max_polls
        )
    }

    async fn download(&self, audio_url: &str) -> Result<Vec<u8>> {
        // Relative URLs are resolved against the provider base.
        let url = Url::parse(audio_url).or_else(|_| self.endpoint(audio_url.trim_start_matches('/')))?;
        let request = if shares_origin(&self.base, &url) {
            self.authorized(self.http.get(url))
        } else {
            self.http.get(url)
        };
        let bytes = request
            .send()
            .await
            .context("failed to download synthesized audio")?
            .error_for_status()
            .context("audio download returned an error status")?
            .bytes()
            .await
            .context("failed to read synthesized audio body")?;
        Ok(bytes.to_vec())
    }
}

/// The credential only travels to the provider's own origin.
fn shares_origin(base: &Url, target: &Url) -> bool {
    base.origin() == target.origin()
}

fn interpret_status(status: TaskStatus) -> Result<PollOutcome> {
    match status.status.to_ascii_lowercase().as_str() {
        "done" | "completed" | "succeeded" => status
            .audio_url
            .filter(|url| !url.trim().is_empty())
            .map(PollOutcome::Done)
            .ok_or_else(|| anyhow!("speech task finished without an audio_url")),
        "error" | "failed" => Err(anyhow!(
            "speech task failed: {}",
            status.error.as_deref().unwrap_or("no reason given")
        )),
        _ => Ok(PollOutcome::Pending),
    }
}

fn is_audio_response(content_type: Option<&str>) -> bool {
    content_type
        .map(|value| {
            let value = value.to_ascii_lowercase();
            value.starts_with("audio/") || value.starts_with("application/octet-stream")
        })
        .unwrap_or(false)
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechClient {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>> {
        let body = TtsBody {
            voice_id: &request.voice_id,
            text: &request.text,
            voice_settings: &request.settings,
        };
        let response = self
            .authorized(self.http.post(self.endpoint("v1/tts")?))
            .json(&body)
            .send()
            .await
            .context("failed to call speech synthesis API")?
            .error_for_status()
            .context("speech synthesis API returned an error status")?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        if is_audio_response(content_type.as_deref()) {
            let bytes = response
                .bytes()
                .await
                .context("failed to read synthesized audio body")?;
            return Ok(bytes.to_vec());
        }

        let created: TaskCreated = response
            .json()
            .await
            .context("failed to decode speech task response")?;
        let audio_url = self.poll_task(&created.task_id).await?;
        self.download(&audio_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(raw: &str) -> TaskStatus {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn done_status_yields_audio_url() {
        let outcome =
            interpret_status(status(r#"{"status":"done","audio_url":"https://x/a.mp3"}"#)).unwrap();
        assert_eq!(outcome, PollOutcome::Done("https://x/a.mp3".into()));
    }

    #[test]
    fn error_status_and_missing_url_fail() {
        let error = interpret_status(status(r#"{"status":"error","error":"quota"}"#)).unwrap_err();
        assert!(error.to_string().contains("quota"));
        assert!(interpret_status(status(r#"{"status":"done"}"#)).is_err());
    }

    #[test]
    fn unknown_status_keeps_polling() {
        let outcome = interpret_status(status(r#"{"status":"queued"}"#)).unwrap();
        assert_eq!(outcome, PollOutcome::Pending);
    }

    #[test]
    fn credential_only_goes_to_provider_origin() {
        let base = Url::parse("https://tts.example.com/api/").unwrap();
        let own = Url::parse("https://tts.example.com/files/a.mp3").unwrap();
        let bucket = Url::parse("https://bucket.s3.amazonaws.com/a.mp3?X-Amz-Signature=abc").unwrap();
        let plain = Url::parse("http://tts.example.com/files/a.mp3").unwrap();
        let other_port = Url::parse("https://tts.example.com:8443/a.mp3").unwrap();
        assert!(shares_origin(&base, &own));
        assert!(!shares_origin(&base, &bucket));
        assert!(!shares_origin(&base, &plain));
        assert!(!shares_origin(&base, &other_port));
    }

    #[test]
    fn endpoints_keep_base_path() {
        let config = SpeechConfig {
            base_url: "https://tts.example.com/api".into(),
            ..SpeechConfig::default()
        };
        let client = HttpSpeechClient::new(&config, None).unwrap();
        assert_eq!(
            client.endpoint("v1/tasks/abc").unwrap().as_str(),
            "https://tts.example.com/api/v1/tasks/abc"
        );
    }

    #[test]
    fn audio_content_types() {
        assert!(is_audio_response(Some("audio/mpeg")));
        assert!(is_audio_response(Some("application/octet-stream")));
        assert!(!is_audio_response(Some("application/json")));
        assert!(!is_audio_response(None));
    }
}

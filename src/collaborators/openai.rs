use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::retry::RetryPolicy;
use super::{CollaboratorFuture, TextTranslator};
use crate::error::PipelineError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const SERVICE: &str = "translator";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Translation through an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiTranslator {
    client: reqwest::Client,
    key: String,
    model: String,
    base_url: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OpenAiTranslator {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Reads the key from `OPENAI_API_KEY`.
    pub fn from_env() -> Option<Self> {
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(Self::new)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        if !base_url.trim().is_empty() {
            self.base_url = base_url.trim_end_matches('/').to_string();
        }
        self
    }

    /// Bounds each HTTP attempt, including reading the response body.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = timeout;
        }
        self
    }

    async fn request(self, text: String, source_lang: String, target_lang: String) -> Result<Option<String>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": system_prompt(&source_lang, &target_lang)},
                {"role": "user", "content": text},
            ],
        });

        let mut delay = self.retry.base_delay;
        let mut attempt = 0;
        loop {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.key)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await
                .with_context(|| format!("failed to reach {}", url))?;
            let status = response.status();
            let headers = response.headers().clone();
            let payload = response
                .text()
                .await
                .with_context(|| "failed to read translation response")?;
            if status.is_success() {
                return parse_completion(&payload);
            }
            if self.retry.should_retry(attempt, status, &payload) {
                delay = self.retry.wait(SERVICE, attempt, delay, &headers).await;
                attempt += 1;
                continue;
            }
            return Err(anyhow!("translation request failed ({}): {}", status, payload));
        }
    }
}

impl TextTranslator for OpenAiTranslator {
    fn translate(
        &self,
        text: String,
        source_lang: String,
        target_lang: String,
    ) -> CollaboratorFuture<Option<String>> {
        let translator = self.clone();
        Box::pin(async move {
            if text.trim().is_empty() {
                return Ok(None);
            }
            debug!(
                "translate: {} chars {} -> {}",
                text.chars().count(),
                source_lang,
                target_lang
            );
            translator
                .request(text, source_lang, target_lang)
                .await
                .map_err(|err| PipelineError::unavailable(SERVICE, format!("{:#}", err)))
        })
    }
}

fn system_prompt(source_lang: &str, target_lang: &str) -> String {
    let source = if source_lang.trim().is_empty() || source_lang.eq_ignore_ascii_case("auto") {
        "the source language".to_string()
    } else {
        format!("language '{}'", source_lang.trim())
    };
    format!(
        "You translate manga speech bubbles from {} into language '{}'. \
         Keep line breaks where they help readability. \
         Reply with the translation only, without quotes or commentary.",
        source,
        target_lang.trim()
    )
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

fn parse_completion(payload: &str) -> Result<Option<String>> {
    let response: CompletionResponse =
        serde_json::from_str(payload).with_context(|| "failed to parse translation response")?;
    let content = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("translation response has no choices"))?
        .message
        .content
        .unwrap_or_default();
    let content = content.trim();
    if content.is_empty() {
        Ok(None)
    } else {
        Ok(Some(content.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_content_is_trimmed() {
        let payload = r#"{"choices":[{"message":{"role":"assistant","content":"  Hello!\n"}}]}"#;
        assert_eq!(
            parse_completion(payload).expect("parse"),
            Some("Hello!".to_string())
        );
    }

    #[test]
    fn empty_completion_is_no_translation() {
        let payload = r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#;
        assert_eq!(parse_completion(payload).expect("parse"), None);
        assert!(parse_completion(r#"{"choices":[]}"#).is_err());
    }

    #[test]
    fn prompt_names_languages() {
        let prompt = system_prompt("auto", "en");
        assert!(prompt.contains("from the source language into language 'en'"));
        let prompt = system_prompt("ja", "fr");
        assert!(prompt.contains("from language 'ja' into language 'fr'"));
    }

    #[tokio::test]
    async fn silent_endpoint_times_out_as_unavailable() {
        // Accepts connections through the backlog but never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("addr"));
        let translator = OpenAiTranslator::new("key")
            .with_base_url(url)
            .with_timeout(Duration::from_millis(200));

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            translator.translate("やあ".to_string(), "ja".to_string(), "en".to_string()),
        )
        .await
        .expect("translation must not hang");
        assert!(matches!(
            result,
            Err(PipelineError::CollaboratorUnavailable {
                service: "translator",
                ..
            })
        ));
        drop(listener);
    }

    #[tokio::test]
    async fn blank_text_skips_the_request() {
        let translator = OpenAiTranslator::new("key").with_base_url("http://127.0.0.1:9");
        let result = translator
            .translate("  ".to_string(), "ja".to_string(), "en".to_string())
            .await
            .expect("translate");
        assert_eq!(result, None);
    }
}

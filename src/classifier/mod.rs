//! Advisory trend classification.
//!
//! A classifier maps formatted market context to one of three trend labels.
//! It never places orders; the hedge controller decides what to do with it.

use crate::config::ClassifierConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument};

/// Market direction as seen by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Uptrend,
    Downtrend,
    Unclear,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Uptrend => "uptrend",
            Trend::Downtrend => "downtrend",
            Trend::Unclear => "unclear",
        }
    }

    /// Parse a label, tolerating case and a few common synonyms.
    pub fn parse_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "uptrend" | "up" | "bullish" => Some(Trend::Uptrend),
            "downtrend" | "down" | "bearish" => Some(Trend::Downtrend),
            "unclear" | "sideways" | "neutral" | "range" => Some(Trend::Unclear),
            _ => None,
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classifier answer.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendAssessment {
    pub trend: Trend,
    pub reason: String,
    /// 0.0 to 1.0
    pub confidence: f64,
}

/// The controller's current view of the trend.
///
/// Starts `unclear` and is only overwritten by a successful classification.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendState {
    pub trend: Trend,
    pub reason: String,
    pub confidence: f64,
}

impl Default for TrendState {
    fn default() -> Self {
        Self {
            trend: Trend::Unclear,
            reason: "no assessment yet".to_string(),
            confidence: 0.0,
        }
    }
}

impl TrendState {
    pub fn apply(&mut self, assessment: TrendAssessment) {
        self.trend = assessment.trend;
        self.reason = assessment.reason;
        self.confidence = assessment.confidence;
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrendClassifier: Send + Sync {
    async fn classify(&self, context: &str) -> Result<TrendAssessment>;
}

const SYSTEM_PROMPT: &str = "You are a cryptocurrency futures market analyst. \
Classify the overall market direction from the multi-timeframe data. \
Respond with JSON only: {\"trend\": \"uptrend\" | \"downtrend\" | \"unclear\", \
\"confidence\": 0.0-1.0, \"reason\": \"one sentence\"}. \
Use \"unclear\" unless the timeframes agree on a direction.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct RawAssessment {
    trend: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: String,
}

/// Classifier backed by an OpenAI-compatible chat completions endpoint.
pub struct LlmTrendClassifier {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
    model: String,
}

impl LlmTrendClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_url: config.api_url.clone(),
            model: config.model.clone(),
        })
    }
}

/// Extract the assessment from model output, stripping markdown fences.
fn parse_assessment(text: &str) -> Result<TrendAssessment> {
    let mut text = text.trim();
    if text.starts_with("```") {
        text = text
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
    }

    let raw: RawAssessment = serde_json::from_str(text)
        .with_context(|| format!("Classifier returned non-JSON output: {}", text))?;
    let trend = Trend::parse_label(&raw.trend)
        .with_context(|| format!("Unknown trend label: {}", raw.trend))?;

    Ok(TrendAssessment {
        trend,
        reason: raw.reason,
        confidence: raw.confidence.clamp(0.0, 1.0),
    })
}

#[async_trait]
impl TrendClassifier for LlmTrendClassifier {
    #[instrument(skip(self, context))]
    async fn classify(&self, context: &str) -> Result<TrendAssessment> {
        let request = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: context,
                },
            ],
        };

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to reach trend classifier")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Classifier API error {}: {}", status, body);
        }

        let chat: ChatResponse = response
            .json()
            .await
            .context("Failed to parse classifier response")?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("Classifier response had no choices")?;

        debug!(%content, "Classifier output");
        parse_assessment(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn classifier_for(server: &MockServer) -> LlmTrendClassifier {
        LlmTrendClassifier::new(&ClassifierConfig {
            api_key: "sk-test".to_string(),
            api_url: format!("{}/v1/chat/completions", server.uri()),
            ..ClassifierConfig::default()
        })
        .unwrap()
    }

    fn completion(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        }))
    }

    #[test]
    fn test_parse_fenced_output() {
        let text = "```json\n{\"trend\": \"Uptrend\", \"confidence\": 1.7, \"reason\": \"HH/HL\"}\n```";
        let assessment = parse_assessment(text).unwrap();
        assert_eq!(assessment.trend, Trend::Uptrend);
        assert_eq!(assessment.confidence, 1.0);
        assert_eq!(assessment.reason, "HH/HL");
    }

    #[test]
    fn test_unknown_label_is_an_error() {
        assert!(parse_assessment("{\"trend\": \"moon\"}").is_err());
        assert!(parse_assessment("probably up").is_err());
    }

    #[test]
    fn test_state_starts_unclear_and_applies() {
        let mut state = TrendState::default();
        assert_eq!(state.trend, Trend::Unclear);
        state.apply(TrendAssessment {
            trend: Trend::Downtrend,
            reason: "lower lows".to_string(),
            confidence: 0.8,
        });
        assert_eq!(state.trend, Trend::Downtrend);
    }

    #[tokio::test]
    async fn test_classify_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(completion(
                "{\"trend\": \"downtrend\", \"confidence\": 0.7, \"reason\": \"below EMA50\"}",
            ))
            .mount(&server)
            .await;

        let assessment = classifier_for(&server).classify("context").await.unwrap();
        assert_eq!(assessment.trend, Trend::Downtrend);
        assert_eq!(assessment.confidence, 0.7);
    }

    #[tokio::test]
    async fn test_http_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = classifier_for(&server).classify("context").await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }
}

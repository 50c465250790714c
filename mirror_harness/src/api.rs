use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persona::{ReflectionResponses, Tone};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// A reflection as created by the product API. Never updated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionRecord {
    pub reflection_id: String,
    pub content: String,
    pub is_premium: bool,
    pub tone: Tone,
    pub submission_payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionReport {
    pub report: Value,
    pub generated_at: DateTime<Utc>,
}

/// The product endpoints the harness drives.
#[async_trait]
pub trait MirrorBackend: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession>;

    async fn submit_reflection(
        &self,
        token: &str,
        responses: &ReflectionResponses,
        tone: Tone,
    ) -> Result<ReflectionRecord>;

    async fn submit_feedback(
        &self,
        token: &str,
        reflection_id: &str,
        rating: u8,
        feedback: &str,
    ) -> Result<()>;

    async fn generate_evolution_report(&self, token: &str) -> Result<EvolutionReport>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReflectionRequest<'a> {
    #[serde(flatten)]
    responses: &'a ReflectionResponses,
    tone: Tone,
}

#[derive(Debug, Serialize)]
struct SignInRequest<'a> {
    action: &'static str,
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct FeedbackRequest<'a> {
    action: &'static str,
    id: &'a str,
    rating: u8,
    feedback: &'a str,
}

#[derive(Debug, Serialize)]
struct ActionRequest {
    action: &'static str,
}

/// Every product response shares the `{success, error}` envelope; the rest of
/// the body depends on the endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    user: Option<Value>,
    #[serde(default)]
    reflection_id: Option<Value>,
    #[serde(default)]
    reflection: Option<String>,
    #[serde(default)]
    is_premium: Option<bool>,
    #[serde(default)]
    report: Option<Value>,
}

impl Envelope {
    fn into_success(self, what: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            let message = self
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| format!("{} failed", what));
            anyhow::bail!(message)
        }
    }
}

#[derive(Clone)]
pub struct MirrorApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl MirrorApiClient {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: normalize_base_url(base_url),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post_envelope<B: Serialize + ?Sized>(
        &self,
        path: &str,
        token: Option<&str>,
        body: &B,
        what: &str,
    ) -> Result<Envelope> {
        let mut req = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read {} response", path))?;

        // The envelope decides success, not the status code
        let envelope: Envelope = serde_json::from_str(&text).with_context(|| {
            format!(
                "Failed to decode {} response ({}): {}",
                path,
                status,
                text.chars().take(300).collect::<String>()
            )
        })?;
        envelope.into_success(what)
    }
}

#[async_trait]
impl MirrorBackend for MirrorApiClient {
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession> {
        let body = SignInRequest {
            action: "signin",
            email,
            password,
        };
        let envelope = self
            .post_envelope("/api/auth", None, &body, "Authentication")
            .await?;

        let token = envelope
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Authentication succeeded but no token was returned"))?;
        let user_id = envelope
            .user
            .as_ref()
            .and_then(|user| user.get("id"))
            .map(json_value_to_id);

        Ok(AuthSession { token, user_id })
    }

    async fn submit_reflection(
        &self,
        token: &str,
        responses: &ReflectionResponses,
        tone: Tone,
    ) -> Result<ReflectionRecord> {
        let body = ReflectionRequest { responses, tone };
        let submission_payload =
            serde_json::to_value(&body).context("Failed to encode reflection payload")?;

        let envelope = self
            .post_envelope("/api/reflection", Some(token), &submission_payload, "Reflection")
            .await?;

        let reflection_id = envelope
            .reflection_id
            .as_ref()
            .map(json_value_to_id)
            .ok_or_else(|| anyhow::anyhow!("Reflection response is missing reflectionId"))?;
        let content = envelope
            .reflection
            .ok_or_else(|| anyhow::anyhow!("Reflection response is missing reflection text"))?;

        Ok(ReflectionRecord {
            reflection_id,
            content,
            is_premium: envelope.is_premium.unwrap_or(false),
            tone,
            submission_payload,
        })
    }

    async fn submit_feedback(
        &self,
        token: &str,
        reflection_id: &str,
        rating: u8,
        feedback: &str,
    ) -> Result<()> {
        let body = FeedbackRequest {
            action: "submit-feedback",
            id: reflection_id,
            rating,
            feedback,
        };
        self.post_envelope("/api/reflections", Some(token), &body, "Feedback submission")
            .await?;
        Ok(())
    }

    async fn generate_evolution_report(&self, token: &str) -> Result<EvolutionReport> {
        let body = ActionRequest {
            action: "generate-report",
        };
        let envelope = self
            .post_envelope("/api/evolution", Some(token), &body, "Evolution report")
            .await?;

        Ok(EvolutionReport {
            report: envelope.report.unwrap_or(Value::Null),
            generated_at: Utc::now(),
        })
    }
}

fn json_value_to_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url(" http://x:3000/ "), "http://x:3000");
        assert_eq!(normalize_base_url("https://mirror.app"), "https://mirror.app");
    }

    #[test]
    fn reflection_payload_flattens_answers_with_tone() {
        let responses = ReflectionResponses {
            dream: Some("studio".to_string()),
            has_date: Some("no".to_string()),
            ..Default::default()
        };
        let body = ReflectionRequest {
            responses: &responses,
            tone: Tone::Gentle,
        };
        let value = serde_json::to_value(&body).expect("encode");
        assert_eq!(value["dream"], "studio");
        assert_eq!(value["hasDate"], "no");
        assert_eq!(value["tone"], "gentle");
        assert!(value.get("responses").is_none());
    }

    #[test]
    fn unsuccessful_envelope_uses_server_error() {
        let envelope: Envelope = serde_json::from_value(serde_json::json!({
            "success": false,
            "error": "Monthly reflection limit reached"
        }))
        .unwrap();
        let err = envelope.into_success("Reflection").unwrap_err();
        assert_eq!(err.to_string(), "Monthly reflection limit reached");
    }

    #[test]
    fn unsuccessful_envelope_without_error_gets_generic_message() {
        let envelope: Envelope = serde_json::from_value(serde_json::json!({})).unwrap();
        let err = envelope.into_success("Reflection").unwrap_err();
        assert_eq!(err.to_string(), "Reflection failed");
    }

    #[test]
    fn numeric_ids_are_stringified() {
        assert_eq!(json_value_to_id(&serde_json::json!(42)), "42");
        assert_eq!(json_value_to_id(&serde_json::json!("abc")), "abc");
    }
}

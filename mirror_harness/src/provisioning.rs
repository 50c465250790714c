//! Test-account setup against the product database.
//!
//! The harness needs a known account before it can sign in. When Supabase
//! credentials are configured the account is created on demand through the
//! PostgREST interface using the service-role key.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::persona::TestUserProfile;

#[async_trait]
pub trait AccountProvisioner: Send + Sync {
    /// Make sure the test user exists and return its id.
    async fn ensure_test_user(&self, profile: &TestUserProfile) -> Result<String>;

    /// Remove reflections left over from earlier runs.
    async fn reset_reflections(&self, user_id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct UserRow {
    id: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct NewUser<'a> {
    email: &'a str,
    name: &'a str,
    password_hash: &'a str,
    tier: &'a str,
    subscription_status: &'static str,
    is_admin: bool,
    is_creator: bool,
}

pub struct SupabaseProvisioner {
    http: reqwest::Client,
    rest_url: String,
    service_key: String,
    password_hash: String,
}

impl SupabaseProvisioner {
    pub fn new(
        supabase_url: &str,
        service_key: String,
        password_hash: String,
        http: reqwest::Client,
    ) -> Self {
        Self {
            http,
            rest_url: format!("{}/rest/v1", supabase_url.trim().trim_end_matches('/')),
            service_key,
            password_hash,
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn find_user_id(&self, email: &str) -> Result<Option<String>> {
        let response = self
            .authorized(self.http.get(format!("{}/users", self.rest_url)))
            .query(&[("email", format!("eq.{}", email)), ("select", "id".to_string())])
            .send()
            .await
            .context("User lookup request failed")?
            .error_for_status()
            .context("User lookup was rejected")?;

        let rows: Vec<UserRow> = response
            .json()
            .await
            .context("Failed to decode user lookup response")?;
        Ok(rows.into_iter().next().map(|row| id_to_string(&row.id)))
    }

    async fn create_user(&self, profile: &TestUserProfile) -> Result<String> {
        let body = NewUser {
            email: &profile.email,
            name: &profile.name,
            password_hash: &self.password_hash,
            tier: &profile.tier,
            subscription_status: "active",
            is_admin: false,
            is_creator: false,
        };

        let response = self
            .authorized(self.http.post(format!("{}/users", self.rest_url)))
            .header("Prefer", "return=representation")
            .json(&body)
            .send()
            .await
            .context("User creation request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("User creation returned error {}: {}", status, body);
        }

        let rows: Vec<UserRow> = response
            .json()
            .await
            .context("Failed to decode created user")?;
        rows.into_iter()
            .next()
            .map(|row| id_to_string(&row.id))
            .ok_or_else(|| anyhow::anyhow!("User creation returned no rows"))
    }
}

#[async_trait]
impl AccountProvisioner for SupabaseProvisioner {
    async fn ensure_test_user(&self, profile: &TestUserProfile) -> Result<String> {
        if let Some(id) = self.find_user_id(&profile.email).await? {
            tracing::info!("Test user {} already exists ({})", profile.email, id);
            return Ok(id);
        }

        let id = self.create_user(profile).await?;
        tracing::info!("Created test user {} ({})", profile.email, id);
        Ok(id)
    }

    async fn reset_reflections(&self, user_id: &str) -> Result<()> {
        self.authorized(self.http.delete(format!("{}/reflections", self.rest_url)))
            .query(&[("user_id", format!("eq.{}", user_id))])
            .send()
            .await
            .context("Reflection reset request failed")?
            .error_for_status()
            .context("Reflection reset was rejected")?;
        tracing::info!("Cleared previous reflections for test user {}", user_id);
        Ok(())
    }
}

fn id_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_url_is_derived_from_project_url() {
        let provisioner = SupabaseProvisioner::new(
            "https://abc.supabase.co/",
            "key".to_string(),
            "hash".to_string(),
            reqwest::Client::new(),
        );
        assert_eq!(provisioner.rest_url, "https://abc.supabase.co/rest/v1");
    }

    #[test]
    fn new_user_row_marks_active_non_admin() {
        let profile = TestUserProfile::alex_chen("alex@example.test");
        let body = NewUser {
            email: &profile.email,
            name: &profile.name,
            password_hash: "hash",
            tier: &profile.tier,
            subscription_status: "active",
            is_admin: false,
            is_creator: false,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["email"], "alex@example.test");
        assert_eq!(value["subscription_status"], "active");
        assert_eq!(value["is_admin"], false);
    }
}

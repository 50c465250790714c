use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "mirror_harness.toml";

/// Placeholder bcrypt hash stored for the synthetic account when the harness
/// provisions it. Must match `test_password` for sign-in to succeed.
pub const DEFAULT_TEST_PASSWORD_HASH: &str =
    "$2b$10$Xq8Q1nV0m4Qb7kE3yJ8fUe9m3dT1cR6vHn2sP5wL0aZ4gK7jB1uCy";

#[derive(Debug, Clone, Serialize)]
pub struct ModelSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelSettings {
    pub fn persona() -> Self {
        Self {
            model: default_llm_model(),
            temperature: default_persona_temperature(),
            max_tokens: default_persona_max_tokens(),
        }
    }

    pub fn evaluator() -> Self {
        Self {
            model: default_llm_model(),
            temperature: default_evaluator_temperature(),
            max_tokens: default_evaluator_max_tokens(),
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self::persona()
    }
}

/// A `[persona]` or `[evaluator]` table as written; absent keys keep the
/// defaults of the table they appear in.
#[derive(Debug, Default, Deserialize)]
struct ModelSettingsTable {
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl ModelSettingsTable {
    fn over(self, base: ModelSettings) -> ModelSettings {
        ModelSettings {
            model: self.model.unwrap_or(base.model),
            temperature: self.temperature.unwrap_or(base.temperature),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
        }
    }
}

fn default_persona_settings() -> ModelSettings {
    ModelSettings::persona()
}

fn default_evaluator_settings() -> ModelSettings {
    ModelSettings::evaluator()
}

fn deserialize_persona_settings<'de, D>(deserializer: D) -> Result<ModelSettings, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(ModelSettingsTable::deserialize(deserializer)?.over(ModelSettings::persona()))
}

fn deserialize_evaluator_settings<'de, D>(deserializer: D) -> Result<ModelSettings, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(ModelSettingsTable::deserialize(deserializer)?.over(ModelSettings::evaluator()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    // Product under test
    #[serde(default = "default_base_url")]
    pub base_url: String,

    // LLM configuration (OpenAI-compatible chat completions)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Supabase (test account provisioning)
    #[serde(default)]
    pub supabase_url: Option<String>,
    #[serde(default)]
    pub supabase_service_role_key: Option<String>,
    #[serde(default)]
    pub reset_previous_reflections: bool,

    // Synthetic test account
    #[serde(default = "default_test_email")]
    pub test_email: String,
    #[serde(default = "default_test_password")]
    pub test_password: String,
    #[serde(default = "default_test_password_hash")]
    pub test_password_hash: String,

    // Cycle behaviour
    #[serde(default = "default_cycles")]
    pub cycles: u32,
    #[serde(default = "default_delay_secs")]
    pub delay_secs: u64,
    #[serde(default = "default_evolution_threshold")]
    pub evolution_threshold: usize,
    #[serde(default)]
    pub strict_parsing: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: Option<u64>,

    // Output
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    // Model settings (TOML tables, keep after plain values)
    #[serde(
        default = "default_persona_settings",
        deserialize_with = "deserialize_persona_settings"
    )]
    pub persona: ModelSettings,
    #[serde(
        default = "default_evaluator_settings",
        deserialize_with = "deserialize_evaluator_settings"
    )]
    pub evaluator: ModelSettings,
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o".to_string()
}

fn default_persona_temperature() -> f32 {
    0.8
}

fn default_persona_max_tokens() -> u32 {
    1000
}

fn default_evaluator_temperature() -> f32 {
    0.3
}

fn default_evaluator_max_tokens() -> u32 {
    1500
}

fn default_test_email() -> String {
    "alex.chen.test@mirror-of-truth.test".to_string()
}

fn default_test_password() -> String {
    "TestPassword123!".to_string()
}

fn default_test_password_hash() -> String {
    DEFAULT_TEST_PASSWORD_HASH.to_string()
}

fn default_cycles() -> u32 {
    6
}

fn default_delay_secs() -> u64 {
    3
}

fn default_evolution_threshold() -> usize {
    6
}

fn default_request_timeout_secs() -> Option<u64> {
    Some(120)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("test-logs")
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            llm_api_url: default_llm_url(),
            llm_api_key: None,
            persona: ModelSettings::persona(),
            evaluator: ModelSettings::evaluator(),
            supabase_url: None,
            supabase_service_role_key: None,
            reset_previous_reflections: false,
            test_email: default_test_email(),
            test_password: default_test_password(),
            test_password_hash: default_test_password_hash(),
            cycles: default_cycles(),
            delay_secs: default_delay_secs(),
            evolution_threshold: default_evolution_threshold(),
            strict_parsing: false,
            request_timeout_secs: default_request_timeout_secs(),
            log_dir: default_log_dir(),
        }
    }
}

impl HarnessConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Default config file location (next to the executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join(CONFIG_FILE_NAME)
    }

    /// Load config from `path` (or the default location), then layer env overrides.
    ///
    /// A missing file falls back to defaults; a file that exists but does not
    /// parse is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::config_path);

        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => {
                let config = Self::from_toml_str(&contents)
                    .with_context(|| format!("Failed to parse {:?}", path))?;
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(_) => {
                tracing::warn!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };

        config.apply_env();
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<HarnessConfig>(contents).context("Invalid harness config")
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("OPENAI_API_KEY") {
            self.llm_api_key = Some(key);
        }
        if let Some(url) = non_empty("OPENAI_API_URL") {
            self.llm_api_url = url;
        }
        if let Some(url) = non_empty("SUPABASE_URL") {
            self.supabase_url = Some(url);
        }
        if let Some(key) = non_empty("SUPABASE_SERVICE_ROLE_KEY") {
            self.supabase_service_role_key = Some(key);
        }
        if let Some(url) = non_empty("MIRROR_BASE_URL") {
            self.base_url = url;
        }
        if let Some(dir) = non_empty("MIRROR_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(cycles) = non_empty("MIRROR_CYCLES").and_then(|v| v.trim().parse().ok()) {
            self.cycles = cycles;
        }
        if let Some(secs) = non_empty("MIRROR_DELAY_SECS").and_then(|v| v.trim().parse().ok()) {
            self.delay_secs = secs;
        }
        if let Some(model) = non_empty("MIRROR_PERSONA_MODEL") {
            self.persona.model = model;
        }
        if let Some(model) = non_empty("MIRROR_EVALUATOR_MODEL") {
            self.evaluator.model = model;
        }
        if let Some(email) = non_empty("MIRROR_TEST_EMAIL") {
            self.test_email = email;
        }
        if let Some(password) = non_empty("MIRROR_TEST_PASSWORD") {
            self.test_password = password;
        }
        if let Some(hash) = non_empty("MIRROR_TEST_PASSWORD_HASH") {
            self.test_password_hash = hash;
        }
        if let Some(enabled) = non_empty("MIRROR_STRICT_PARSING") {
            self.strict_parsing = parse_flag(&enabled);
        }
        if let Some(secs) = non_empty("MIRROR_REQUEST_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.request_timeout_secs = if secs == 0 { None } else { Some(secs) };
        }
        if let Some(threshold) =
            non_empty("MIRROR_EVOLUTION_THRESHOLD").and_then(|v| v.trim().parse().ok())
        {
            self.evolution_threshold = threshold;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self
            .llm_api_key
            .as_deref()
            .map(|k| k.trim().is_empty())
            .unwrap_or(true)
        {
            anyhow::bail!("OPENAI_API_KEY is not set");
        }
        if self.cycles == 0 {
            anyhow::bail!("cycles must be at least 1");
        }
        if self.base_url.trim().is_empty() {
            anyhow::bail!("base_url must not be empty");
        }
        Ok(())
    }

    pub fn has_supabase_credentials(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.supabase_url) && present(&self.supabase_service_role_key)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Copy with secrets masked, safe to print or log.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.llm_api_key = copy.llm_api_key.as_deref().map(mask_secret);
        copy.supabase_service_role_key = copy.supabase_service_role_key.as_deref().map(mask_secret);
        copy.test_password = mask_secret(&copy.test_password);
        copy
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

fn parse_flag(raw: &str) -> bool {
    let raw = raw.trim();
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= 4 {
        return "****".to_string();
    }
    let tail: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_harness_expectations() {
        let config = HarnessConfig::default();
        assert_eq!(config.cycles, 6);
        assert_eq!(config.delay_secs, 3);
        assert_eq!(config.evolution_threshold, 6);
        assert_eq!(config.persona.temperature, 0.8);
        assert_eq!(config.evaluator.temperature, 0.3);
        assert_eq!(config.evaluator.max_tokens, 1500);
        assert!(!config.strict_parsing);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = HarnessConfig::from_toml_str(
            r#"
            base_url = "https://mirror.example"
            cycles = 3

            [evaluator]
            model = "gpt-4o-mini"
            "#,
        )
        .expect("parse");
        assert_eq!(config.base_url, "https://mirror.example");
        assert_eq!(config.cycles, 3);
        assert_eq!(config.evaluator.model, "gpt-4o-mini");
        assert_eq!(config.evaluator.temperature, 0.3);
        assert_eq!(config.evaluator.max_tokens, 1500);
        assert_eq!(config.persona.model, "gpt-4o");
        assert_eq!(config.log_dir, PathBuf::from("test-logs"));
    }

    #[test]
    fn partial_model_tables_keep_their_own_defaults() {
        let config = HarnessConfig::from_toml_str(
            r#"
            [persona]
            temperature = 1.0

            [evaluator]
            max_tokens = 2000
            "#,
        )
        .expect("parse");
        assert_eq!(config.persona.model, "gpt-4o");
        assert_eq!(config.persona.temperature, 1.0);
        assert_eq!(config.persona.max_tokens, 1000);
        assert_eq!(config.evaluator.temperature, 0.3);
        assert_eq!(config.evaluator.max_tokens, 2000);
    }

    #[test]
    fn dumped_config_parses_back() {
        let mut config = HarnessConfig::default();
        config.evaluator.temperature = 0.5;
        let text = config.to_toml_string().expect("toml");
        let parsed = HarnessConfig::from_toml_str(&text).expect("parse");
        assert_eq!(parsed.evaluator.temperature, 0.5);
        assert_eq!(parsed.evaluator.max_tokens, 1500);
        assert_eq!(parsed.persona.temperature, 0.8);
    }

    #[test]
    fn env_overrides_apply_and_bad_numbers_are_ignored() {
        let mut config = HarnessConfig::default();
        config.apply_env_with(lookup_from(&[
            ("OPENAI_API_KEY", "sk-test-1234"),
            ("SUPABASE_URL", "https://db.example"),
            ("SUPABASE_SERVICE_ROLE_KEY", "service-key"),
            ("MIRROR_CYCLES", "not-a-number"),
            ("MIRROR_DELAY_SECS", "0"),
            ("MIRROR_STRICT_PARSING", "Yes"),
            ("MIRROR_REQUEST_TIMEOUT_SECS", "0"),
        ]));

        assert_eq!(config.llm_api_key.as_deref(), Some("sk-test-1234"));
        assert!(config.has_supabase_credentials());
        assert_eq!(config.cycles, 6);
        assert_eq!(config.delay_secs, 0);
        assert!(config.strict_parsing);
        assert!(config.request_timeout().is_none());
    }

    #[test]
    fn blank_env_values_do_not_clobber() {
        let mut config = HarnessConfig::default();
        config.apply_env_with(lookup_from(&[("MIRROR_BASE_URL", "   ")]));
        assert_eq!(config.base_url, "http://localhost:3000");
    }

    #[test]
    fn validate_requires_api_key_and_cycles() {
        let mut config = HarnessConfig::default();
        assert!(config.validate().is_err());

        config.llm_api_key = Some("sk-live".to_string());
        assert!(config.validate().is_ok());

        config.cycles = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn redacted_masks_secrets() {
        let mut config = HarnessConfig::default();
        config.llm_api_key = Some("sk-abcdef123456".to_string());
        config.supabase_service_role_key = Some("abc".to_string());

        let redacted = config.redacted();
        assert_eq!(redacted.llm_api_key.as_deref(), Some("****3456"));
        assert_eq!(redacted.supabase_service_role_key.as_deref(), Some("****"));
        assert!(!redacted.test_password.contains("Test"));
        assert!(redacted.to_toml_string().expect("toml").contains("****3456"));
    }
}

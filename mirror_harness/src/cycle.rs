//! The testing loop: sign in, run N reflection cycles, score them, summarize.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::api::{EvolutionReport, MirrorApiClient, MirrorBackend};
use crate::config::HarnessConfig;
use crate::evaluator::{Evaluator, Ratings};
use crate::feedback::submit_feedback;
use crate::http_client::build_http_client_with_timeout;
use crate::llm_client::{CompletionModel, CompletionParams, LlmClient};
use crate::pacing::Pacer;
use crate::persona::{HistoryEntry, PersonaGenerator, TestUserProfile, Tone};
use crate::provisioning::{AccountProvisioner, SupabaseProvisioner};
use crate::session_log::{EvaluationRecord, ResponseLogEntry, SessionLogger};
use crate::summary::RunSummary;

/// State threaded through every step of a run.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: Option<String>,
    pub auth_token: String,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedCycle {
    pub reflection_id: String,
    pub is_premium: bool,
    /// Parsed overall rating; `None` when the evaluation had no usable line.
    pub rating: Option<u8>,
    /// Rating actually sent with the feedback (falls back to the default).
    pub submitted_rating: u8,
    pub ratings: Ratings,
    pub feedback_delivered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CycleOutcome {
    Failed { error: String },
    Completed(CompletedCycle),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleResult {
    pub reflection_number: u32,
    pub tone: Tone,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: CycleOutcome,
}

impl CycleResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Completed(_))
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            CycleOutcome::Failed { error } => Some(error.as_str()),
            CycleOutcome::Completed(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub session_id: String,
    pub results: Vec<CycleResult>,
    pub evolution_report: Option<EvolutionReport>,
    pub summary: RunSummary,
    pub summary_path: PathBuf,
}

pub struct CycleRunner {
    config: HarnessConfig,
    model: Arc<dyn CompletionModel>,
    backend: Arc<dyn MirrorBackend>,
    provisioner: Option<Arc<dyn AccountProvisioner>>,
    persona: PersonaGenerator,
    evaluator: Evaluator,
    pacer: Pacer,
}

impl CycleRunner {
    pub fn new(
        config: HarnessConfig,
        model: Arc<dyn CompletionModel>,
        backend: Arc<dyn MirrorBackend>,
        provisioner: Option<Arc<dyn AccountProvisioner>>,
    ) -> Self {
        let profile = TestUserProfile::alex_chen(config.test_email.clone());
        let persona = PersonaGenerator::new(
            profile,
            CompletionParams::from(&config.persona),
            config.strict_parsing,
        );
        let evaluator = Evaluator::new(CompletionParams::from(&config.evaluator));
        let pacer = Pacer::new(config.delay());

        Self {
            config,
            model,
            backend,
            provisioner,
            persona,
            evaluator,
            pacer,
        }
    }

    /// Wire up the real HTTP clients described by `config`.
    pub fn from_config(config: HarnessConfig, skip_provision: bool) -> Result<Self> {
        let http = build_http_client_with_timeout(config.request_timeout())?;

        let model: Arc<dyn CompletionModel> = Arc::new(LlmClient::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone().unwrap_or_default(),
            http.clone(),
        ));
        let api = MirrorApiClient::new(&config.base_url, http.clone());
        tracing::info!("Testing against {}", api.base_url());
        let backend: Arc<dyn MirrorBackend> = Arc::new(api);

        let provisioner: Option<Arc<dyn AccountProvisioner>> = match (
            skip_provision,
            config.supabase_url.as_deref(),
            config.supabase_service_role_key.as_deref(),
        ) {
            (false, Some(url), Some(key)) if config.has_supabase_credentials() => {
                Some(Arc::new(SupabaseProvisioner::new(
                    url,
                    key.to_string(),
                    config.test_password_hash.clone(),
                    http,
                )))
            }
            (true, _, _) => {
                tracing::info!("Test account provisioning disabled; assuming the account exists");
                None
            }
            _ => {
                tracing::warn!(
                    "SUPABASE_URL / SUPABASE_SERVICE_ROLE_KEY not set; assuming the test account exists"
                );
                None
            }
        };

        Ok(Self::new(config, model, backend, provisioner))
    }

    pub fn profile(&self) -> &TestUserProfile {
        self.persona.profile()
    }

    pub fn open_session_log(&self) -> Result<SessionLogger> {
        let profile = self.profile();
        SessionLogger::create(&self.config.log_dir, &profile.slug(), &profile.name, Utc::now())
    }

    /// Provision the account (when configured) and sign in. Failures are fatal.
    pub async fn setup(&self, logger: &SessionLogger) -> Result<SessionContext> {
        match self.try_setup().await {
            Ok(ctx) => Ok(ctx),
            Err(error) => {
                logger.log_error("setup", &format!("{:#}", error));
                tracing::error!("Setup failed: {:#}", error);
                Err(error)
            }
        }
    }

    async fn try_setup(&self) -> Result<SessionContext> {
        let profile = self.profile();

        let mut user_id = None;
        if let Some(provisioner) = &self.provisioner {
            let id = provisioner
                .ensure_test_user(profile)
                .await
                .context("Failed to provision test user")?;
            if self.config.reset_previous_reflections {
                provisioner
                    .reset_reflections(&id)
                    .await
                    .context("Failed to clear previous reflections")?;
            }
            user_id = Some(id);
        }

        let session = self
            .backend
            .sign_in(&profile.email, &self.config.test_password)
            .await
            .context("Failed to authenticate test user")?;
        tracing::info!("Signed in as {}", profile.email);

        Ok(SessionContext {
            user_id: user_id.or(session.user_id),
            auth_token: session.token,
            history: Vec::new(),
        })
    }

    /// Run one reflection cycle. Errors are folded into the result.
    pub async fn run_cycle(
        &self,
        ctx: &mut SessionContext,
        logger: &mut SessionLogger,
        index: u32,
    ) -> CycleResult {
        let tone = Tone::for_cycle(index);
        tracing::info!(
            "Reflection #{}/{} ({} tone)",
            index,
            self.config.cycles,
            tone
        );

        let outcome = match self.try_cycle(ctx, logger, index, tone).await {
            Ok(completed) => {
                tracing::info!(
                    "Reflection #{} complete (rating {})",
                    index,
                    completed
                        .rating
                        .map(|r| format!("{}/10", r))
                        .unwrap_or_else(|| "unparsed".to_string())
                );
                CycleOutcome::Completed(completed)
            }
            Err(error) => {
                let message = format!("{:#}", error);
                tracing::error!("Reflection #{} failed: {}", index, message);
                logger.log_error(&format!("reflection #{}", index), &message);
                CycleOutcome::Failed { error: message }
            }
        };

        CycleResult {
            reflection_number: index,
            tone,
            timestamp: Utc::now(),
            outcome,
        }
    }

    async fn try_cycle(
        &self,
        ctx: &mut SessionContext,
        logger: &mut SessionLogger,
        index: u32,
        tone: Tone,
    ) -> Result<CompletedCycle> {
        let (raw_completion, responses) = self
            .persona
            .generate(self.model.as_ref(), &ctx.history, tone, index)
            .await
            .context("Persona generation failed")?;
        logger.log_response(&ResponseLogEntry {
            timestamp: Utc::now(),
            reflection_number: index,
            tone,
            raw_completion,
            responses: responses.clone(),
        })?;

        let record = self
            .backend
            .submit_reflection(&ctx.auth_token, &responses, tone)
            .await
            .context("Reflection submission failed")?;
        logger.log_reflection(index, &record)?;

        let evaluation = self
            .evaluator
            .evaluate(self.model.as_ref(), &responses, &record.content, tone, index)
            .await
            .context("Evaluation failed")?;
        logger.log_evaluation(&EvaluationRecord {
            timestamp: Utc::now(),
            reflection_number: index,
            tone,
            original_responses: responses.clone(),
            mirror_reflection: record.content.clone(),
            evaluation: evaluation.text.clone(),
            ratings: evaluation.ratings.clone(),
        })?;

        let feedback = submit_feedback(
            self.backend.as_ref(),
            &ctx.auth_token,
            &record.reflection_id,
            &evaluation.text,
        )
        .await;

        let rating = feedback.rating.parsed.then_some(feedback.rating.value);
        ctx.history.push(HistoryEntry::new(index, tone, &responses, rating));

        Ok(CompletedCycle {
            reflection_id: record.reflection_id,
            is_premium: record.is_premium,
            rating,
            submitted_rating: feedback.rating.value,
            ratings: evaluation.ratings,
            feedback_delivered: feedback.delivered,
        })
    }

    async fn maybe_generate_evolution_report(
        &self,
        ctx: &SessionContext,
        successful: usize,
    ) -> Option<EvolutionReport> {
        if successful < self.config.evolution_threshold {
            tracing::info!(
                "Skipping evolution report ({} successful reflections, need {})",
                successful,
                self.config.evolution_threshold
            );
            return None;
        }

        match self.backend.generate_evolution_report(&ctx.auth_token).await {
            Ok(report) => {
                tracing::info!("Evolution report generated");
                Some(report)
            }
            Err(error) => {
                tracing::warn!("Evolution report generation failed: {:#}", error);
                None
            }
        }
    }

    /// Full run: setup, every cycle, optional evolution report, summary.
    pub async fn run(&self, logger: &mut SessionLogger) -> Result<RunReport> {
        tracing::info!(
            "Starting {} reflection cycles against {} as {}",
            self.config.cycles,
            self.config.base_url,
            self.profile().name
        );

        let mut ctx = self.setup(logger).await?;

        let total = self.config.cycles;
        let mut results = Vec::with_capacity(total as usize);
        for index in 1..=total {
            let result = self.run_cycle(&mut ctx, logger, index).await;
            results.push(result);
            self.pacer.between(index, total).await;
        }

        let successful = results.iter().filter(|r| r.is_success()).count();
        let evolution_report = self.maybe_generate_evolution_report(&ctx, successful).await;
        logger.set_evolution_report(evolution_report.clone())?;

        let summary = RunSummary::from_results(
            logger.session_id(),
            &results,
            evolution_report.is_some(),
        );
        let summary_path = logger.write_summary(&summary.render())?;
        logger.finish()?;

        tracing::info!(
            "Run finished: {}/{} successful, summary at {:?}",
            summary.successful,
            summary.total,
            summary_path
        );

        Ok(RunReport {
            session_id: logger.session_id().to_string(),
            results,
            evolution_report,
            summary,
            summary_path,
        })
    }
}

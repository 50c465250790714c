use serde::{Deserialize, Serialize};

use crate::api::MirrorBackend;
use crate::evaluator::{extract_feedback_text, extract_overall_rating, RatingOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackOutcome {
    pub rating: RatingOutcome,
    pub feedback: String,
    pub delivered: bool,
}

/// Attach the evaluation's rating and critique to a reflection.
///
/// Never fails: a rejected submission is logged and reported through
/// `delivered`, and the rating falls back to the default when the evaluation
/// has no overall line.
pub async fn submit_feedback(
    backend: &dyn MirrorBackend,
    token: &str,
    reflection_id: &str,
    evaluation_text: &str,
) -> FeedbackOutcome {
    let rating = extract_overall_rating(evaluation_text);
    let feedback = extract_feedback_text(evaluation_text);

    let delivered = match backend
        .submit_feedback(token, reflection_id, rating.value, &feedback)
        .await
    {
        Ok(()) => {
            tracing::debug!(
                "Submitted feedback for reflection {} (rating {})",
                reflection_id,
                rating.value
            );
            true
        }
        Err(error) => {
            tracing::warn!(
                "Feedback submission for reflection {} failed: {:#}",
                reflection_id,
                error
            );
            false
        }
    };

    FeedbackOutcome {
        rating,
        feedback,
        delivered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{AuthSession, EvolutionReport, ReflectionRecord};
    use crate::persona::{ReflectionResponses, Tone};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FeedbackOnly {
        fail: bool,
        sent: Mutex<Vec<(String, u8, String)>>,
    }

    #[async_trait]
    impl MirrorBackend for FeedbackOnly {
        async fn sign_in(&self, _email: &str, _password: &str) -> Result<AuthSession> {
            unreachable!()
        }

        async fn submit_reflection(
            &self,
            _token: &str,
            _responses: &ReflectionResponses,
            _tone: Tone,
        ) -> Result<ReflectionRecord> {
            unreachable!()
        }

        async fn submit_feedback(
            &self,
            _token: &str,
            reflection_id: &str,
            rating: u8,
            feedback: &str,
        ) -> Result<()> {
            self.sent.lock().unwrap().push((
                reflection_id.to_string(),
                rating,
                feedback.to_string(),
            ));
            if self.fail {
                anyhow::bail!("server unavailable");
            }
            Ok(())
        }

        async fn generate_evolution_report(&self, _token: &str) -> Result<EvolutionReport> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn sends_extracted_rating_and_feedback() {
        let backend = FeedbackOnly {
            fail: false,
            sent: Mutex::new(Vec::new()),
        };
        let outcome = submit_feedback(
            &backend,
            "tok",
            "r-1",
            "OVERALL RATING: 9/10\nMISSED OPPORTUNITIES: the partner",
        )
        .await;

        assert!(outcome.delivered);
        assert_eq!(outcome.rating.value, 9);
        assert!(outcome.rating.parsed);
        let sent = backend.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            (
                "r-1".to_string(),
                9,
                "MISSED OPPORTUNITIES: the partner".to_string()
            )
        );
    }

    #[tokio::test]
    async fn failure_is_swallowed_with_default_rating() {
        let backend = FeedbackOnly {
            fail: true,
            sent: Mutex::new(Vec::new()),
        };
        let outcome = submit_feedback(&backend, "tok", "r-2", "no score given").await;

        assert!(!outcome.delivered);
        assert_eq!(outcome.rating.value, 7);
        assert!(!outcome.rating.parsed);
        assert_eq!(backend.sent.lock().unwrap()[0].1, 7);
    }
}

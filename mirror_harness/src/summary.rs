use serde::Serialize;

use crate::cycle::{CycleOutcome, CycleResult};
use crate::persona::Tone;

#[derive(Debug, Clone, Serialize)]
pub struct ToneSummary {
    pub tone: Tone,
    pub rated: usize,
    pub average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DimensionSummary {
    pub dimension: &'static str,
    pub average: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureLine {
    pub reflection_number: u32,
    pub tone: Tone,
    pub error: String,
}

/// Aggregate view of a run.
///
/// Averages only cover successful cycles whose evaluation carried a parseable
/// overall rating; cycles that fell back to the default rating are counted in
/// `unrated` instead.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub session_id: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub unrated: usize,
    pub feedback_delivered: usize,
    pub average_rating: Option<f64>,
    pub by_tone: Vec<ToneSummary>,
    pub by_dimension: Vec<DimensionSummary>,
    pub evolution_report_generated: bool,
    pub failures: Vec<FailureLine>,
}

fn mean(values: &[u8]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().map(|v| f64::from(*v)).sum();
    Some(sum / values.len() as f64)
}

fn format_average(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.1}", v))
        .unwrap_or_else(|| "n/a".to_string())
}

impl RunSummary {
    pub fn from_results(
        session_id: &str,
        results: &[CycleResult],
        evolution_report_generated: bool,
    ) -> Self {
        let completed: Vec<(&CycleResult, &crate::cycle::CompletedCycle)> = results
            .iter()
            .filter_map(|r| match &r.outcome {
                CycleOutcome::Completed(done) => Some((r, done)),
                CycleOutcome::Failed { .. } => None,
            })
            .collect();

        let ratings: Vec<u8> = completed.iter().filter_map(|(_, c)| c.rating).collect();

        let by_tone = Tone::ROTATION
            .iter()
            .map(|tone| {
                let tone_ratings: Vec<u8> = completed
                    .iter()
                    .filter(|(r, _)| r.tone == *tone)
                    .filter_map(|(_, c)| c.rating)
                    .collect();
                ToneSummary {
                    tone: *tone,
                    rated: tone_ratings.len(),
                    average: mean(&tone_ratings),
                }
            })
            .collect();

        let dimension_names = crate::evaluator::Ratings::default().dimensions();
        let by_dimension = dimension_names
            .iter()
            .enumerate()
            .map(|(slot, (name, _))| {
                let values: Vec<u8> = completed
                    .iter()
                    .filter_map(|(_, c)| c.ratings.dimensions()[slot].1)
                    .collect();
                DimensionSummary {
                    dimension: *name,
                    average: mean(&values),
                }
            })
            .collect();

        let failures = results
            .iter()
            .filter_map(|r| match &r.outcome {
                CycleOutcome::Failed { error } => Some(FailureLine {
                    reflection_number: r.reflection_number,
                    tone: r.tone,
                    error: error.clone(),
                }),
                CycleOutcome::Completed(_) => None,
            })
            .collect::<Vec<_>>();

        Self {
            session_id: session_id.to_string(),
            total: results.len(),
            successful: completed.len(),
            failed: failures.len(),
            unrated: completed.iter().filter(|(_, c)| c.rating.is_none()).count(),
            feedback_delivered: completed.iter().filter(|(_, c)| c.feedback_delivered).count(),
            average_rating: mean(&ratings),
            by_tone,
            by_dimension,
            evolution_report_generated,
            failures,
        }
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            "MIRROR OF TRUTH TESTING SUMMARY".to_string(),
            format!("Session: {}", self.session_id),
            String::new(),
            format!("Reflections attempted: {}", self.total),
            format!("Successful: {}", self.successful),
            format!("Failed: {}", self.failed),
            format!("Unrated (no parseable overall rating): {}", self.unrated),
            format!(
                "Feedback delivered: {}/{}",
                self.feedback_delivered, self.successful
            ),
            format!("Average rating: {}", format_average(self.average_rating)),
            String::new(),
            "By tone:".to_string(),
        ];

        lines.extend(self.by_tone.iter().map(|tone| {
            format!(
                "  {}: {} ({} rated)",
                tone.tone,
                format_average(tone.average),
                tone.rated
            )
        }));
        lines.push(String::new());

        lines.push("By dimension:".to_string());
        lines.extend(self.by_dimension.iter().map(|dimension| {
            format!(
                "  {}: {}",
                dimension.dimension.replace('_', " "),
                format_average(dimension.average)
            )
        }));
        lines.push(String::new());

        let evolution = if self.evolution_report_generated {
            "generated"
        } else {
            "not generated"
        };
        lines.push(format!("Evolution report: {}", evolution));

        if !self.failures.is_empty() {
            lines.push(String::new());
            lines.push("Failures:".to_string());
            lines.extend(self.failures.iter().map(|failure| {
                format!(
                    "  #{} ({}): {}",
                    failure.reflection_number, failure.tone, failure.error
                )
            }));
        }

        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

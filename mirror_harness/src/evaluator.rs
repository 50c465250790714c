use anyhow::Result;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::llm_client::{CompletionModel, CompletionParams, Message};
use crate::persona::{ReflectionResponses, Tone};

pub const DEFAULT_OVERALL_RATING: u8 = 7;

const RECOGNITION_LABEL: &str = "RECOGNITION ACCURACY";
const INSIGHT_LABEL: &str = "INSIGHT QUALITY";
const TONE_LABEL: &str = "TONE EFFECTIVENESS";
const SPECIFICITY_LABEL: &str = "SPECIFICITY";
const OVERALL_LABEL: &str = "OVERALL RATING";

const DIMENSION_LABELS: [&str; 5] = [
    RECOGNITION_LABEL,
    INSIGHT_LABEL,
    TONE_LABEL,
    SPECIFICITY_LABEL,
    OVERALL_LABEL,
];

static DIMENSION_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    DIMENSION_LABELS
        .iter()
        .map(|label| {
            let pattern = format!(r"{}:[^\n]*?(\d+)\s*/\s*10", label);
            (*label, Regex::new(&pattern).expect("dimension pattern is valid"))
        })
        .collect()
});

static OVERALL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"OVERALL RATING: (\d+)/10").expect("overall pattern is valid"));

fn in_rating_range(score: &u8) -> bool {
    (1..=10).contains(score)
}

/// Per-dimension scores pulled out of an evaluation. A dimension whose line is
/// absent or malformed stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratings {
    pub recognition_accuracy: Option<u8>,
    pub insight_quality: Option<u8>,
    pub tone_effectiveness: Option<u8>,
    pub specificity: Option<u8>,
    pub overall: Option<u8>,
}

impl Ratings {
    pub fn dimensions(&self) -> [(&'static str, Option<u8>); 5] {
        [
            ("recognition_accuracy", self.recognition_accuracy),
            ("insight_quality", self.insight_quality),
            ("tone_effectiveness", self.tone_effectiveness),
            ("specificity", self.specificity),
            ("overall", self.overall),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingOutcome {
    pub value: u8,
    pub parsed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub text: String,
    pub ratings: Ratings,
}

pub fn build_evaluation_prompt(
    responses: &ReflectionResponses,
    reflection_text: &str,
    tone: Tone,
    index: u32,
) -> String {
    let field = |value: &Option<String>| value.as_deref().unwrap_or("(not answered)").to_string();

    format!(
        "Evaluate reflection #{index}, written by the Mirror of Truth in the \"{tone}\" tone.\n\n\
         ## What the user shared\n\
         Dream: {dream}\n\
         Plan: {plan}\n\
         Has date: {has_date}\n\
         Date: {dream_date}\n\
         Relationship with the dream: {relationship}\n\
         Offering: {offering}\n\n\
         ## The mirror's reflection\n\
         {reflection}\n\n\
         ## Rubric\n\
         Score each dimension from 1 to 10:\n\
         - Recognition accuracy: did it truly see what the user expressed, including what was implied?\n\
         - Insight quality: did it surface something the user had not already said?\n\
         - Tone effectiveness: did the voice match the requested {tone} tone?\n\
         - Specificity: did it engage the user's actual words rather than generic encouragement?\n\n\
         Respond in exactly this format:\n\
         {RECOGNITION_LABEL}: X/10 - <one sentence>\n\
         {INSIGHT_LABEL}: X/10 - <one sentence>\n\
         {TONE_LABEL}: X/10 - <one sentence>\n\
         {SPECIFICITY_LABEL}: X/10 - <one sentence>\n\
         {OVERALL_LABEL}: X/10\n\
         MISSED OPPORTUNITIES: <what the reflection could have noticed>\n\
         IMPROVEMENT SUGGESTIONS: <concrete changes>\n",
        index = index,
        tone = tone,
        dream = field(&responses.dream),
        plan = field(&responses.plan),
        has_date = field(&responses.has_date),
        dream_date = field(&responses.dream_date),
        relationship = field(&responses.relationship),
        offering = field(&responses.offering),
        reflection = reflection_text.trim(),
    )
}

fn extract_dimension(text: &str, label: &str) -> Option<u8> {
    let (_, re) = DIMENSION_PATTERNS.iter().find(|(l, _)| *l == label)?;
    text.lines()
        .filter(|line| line.contains(label))
        .find_map(|line| re.captures(line))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .filter(in_rating_range)
}

pub fn extract_ratings(text: &str) -> Ratings {
    Ratings {
        recognition_accuracy: extract_dimension(text, RECOGNITION_LABEL),
        insight_quality: extract_dimension(text, INSIGHT_LABEL),
        tone_effectiveness: extract_dimension(text, TONE_LABEL),
        specificity: extract_dimension(text, SPECIFICITY_LABEL),
        overall: extract_dimension(text, OVERALL_LABEL),
    }
}

/// Overall rating for feedback submission, falling back to
/// [`DEFAULT_OVERALL_RATING`] when the line is missing or out of 1..=10.
pub fn extract_overall_rating(text: &str) -> RatingOutcome {
    let parsed = OVERALL_PATTERN
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u8>().ok())
        .filter(in_rating_range);

    match parsed {
        Some(value) => RatingOutcome {
            value,
            parsed: true,
        },
        None => RatingOutcome {
            value: DEFAULT_OVERALL_RATING,
            parsed: false,
        },
    }
}

pub fn extract_feedback_text(text: &str) -> String {
    text.lines()
        .filter(|line| {
            line.contains("MISSED OPPORTUNITIES:") || line.contains("IMPROVEMENT SUGGESTIONS:")
        })
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct Evaluator {
    params: CompletionParams,
}

impl Evaluator {
    pub fn new(params: CompletionParams) -> Self {
        Self { params }
    }

    pub async fn evaluate(
        &self,
        model: &dyn CompletionModel,
        responses: &ReflectionResponses,
        reflection_text: &str,
        tone: Tone,
        index: u32,
    ) -> Result<Evaluation> {
        let messages = vec![
            Message::developer(
                "You are a demanding reviewer of AI-written reflective feedback. \
                 Score strictly and follow the requested output format exactly.",
            ),
            Message::user(build_evaluation_prompt(
                responses,
                reflection_text,
                tone,
                index,
            )),
        ];

        let text = model.complete(messages, &self.params).await?;
        let ratings = extract_ratings(&text);
        if ratings.overall.is_none() {
            tracing::debug!("Evaluation for reflection #{} has no overall rating line", index);
        }

        Ok(Evaluation { text, ratings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    const WELL_FORMED: &str = "RECOGNITION ACCURACY: 8/10 - caught the fear of starting\n\
         INSIGHT QUALITY: 6/10 - mostly restated the plan\n\
         TONE EFFECTIVENESS: 9/10 - gentle without being vague\n\
         SPECIFICITY: 7/10 - quoted the portfolio detail\n\
         OVERALL RATING: 9/10\n\
         MISSED OPPORTUNITIES: never addressed the partner's hesitation\n\
         IMPROVEMENT SUGGESTIONS: name the avoidance pattern directly";

    #[test]
    fn extracts_all_dimensions_from_well_formed_text() {
        let ratings = extract_ratings(WELL_FORMED);
        assert_eq!(ratings.recognition_accuracy, Some(8));
        assert_eq!(ratings.insight_quality, Some(6));
        assert_eq!(ratings.tone_effectiveness, Some(9));
        assert_eq!(ratings.specificity, Some(7));
        assert_eq!(ratings.overall, Some(9));
    }

    #[test]
    fn missing_or_malformed_dimensions_are_absent() {
        let text = "RECOGNITION ACCURACY: eight out of ten\n\
                    TONE EFFECTIVENESS: 42/10\n\
                    OVERALL RATING: 5 / 10";
        let ratings = extract_ratings(text);
        assert_eq!(ratings.recognition_accuracy, None);
        assert_eq!(ratings.insight_quality, None);
        assert_eq!(ratings.tone_effectiveness, None);
        assert_eq!(ratings.specificity, None);
        assert_eq!(ratings.overall, Some(5));
    }

    #[test]
    fn overall_rating_parses_or_defaults_to_seven() {
        assert_eq!(
            extract_overall_rating(WELL_FORMED),
            RatingOutcome {
                value: 9,
                parsed: true
            }
        );
        assert_eq!(
            extract_overall_rating("The reflection was fine."),
            RatingOutcome {
                value: 7,
                parsed: false
            }
        );
    }

    #[test]
    fn out_of_range_overall_rating_counts_as_unparsed() {
        for text in ["OVERALL RATING: 42/10", "OVERALL RATING: 0/10"] {
            assert_eq!(
                extract_overall_rating(text),
                RatingOutcome {
                    value: DEFAULT_OVERALL_RATING,
                    parsed: false
                },
                "{text}"
            );
            assert_eq!(extract_ratings(text).overall, None, "{text}");
        }
        assert_eq!(extract_overall_rating("OVERALL RATING: 10/10").value, 10);
        assert_eq!(extract_overall_rating("OVERALL RATING: 1/10").value, 1);
    }

    #[test]
    fn rating_patterns_compile() {
        assert_eq!(DIMENSION_PATTERNS.len(), DIMENSION_LABELS.len());
        assert!(OVERALL_PATTERN.is_match("OVERALL RATING: 8/10"));
    }

    #[test]
    fn feedback_text_collects_labeled_lines() {
        let feedback = extract_feedback_text(WELL_FORMED);
        assert_eq!(
            feedback,
            "MISSED OPPORTUNITIES: never addressed the partner's hesitation\n\
             IMPROVEMENT SUGGESTIONS: name the avoidance pattern directly"
        );
        assert!(extract_feedback_text("nothing here").is_empty());
    }

    #[test]
    fn prompt_lists_answers_and_format() {
        let responses = ReflectionResponses {
            dream: Some("design studio".to_string()),
            ..Default::default()
        };
        let prompt = build_evaluation_prompt(&responses, "You already know.", Tone::Intense, 2);
        assert!(prompt.contains("reflection #2"));
        assert!(prompt.contains("\"intense\" tone"));
        assert!(prompt.contains("Dream: design studio"));
        assert!(prompt.contains("Plan: (not answered)"));
        assert!(prompt.contains("OVERALL RATING: X/10"));
        assert!(prompt.contains("You already know."));
    }

    struct FixedModel(&'static str);

    #[async_trait]
    impl CompletionModel for FixedModel {
        async fn complete(
            &self,
            _messages: Vec<Message>,
            params: &CompletionParams,
        ) -> Result<String> {
            assert_eq!(params.temperature, 0.3);
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn evaluate_returns_text_and_ratings() {
        let evaluator = Evaluator::new(CompletionParams::from(
            &crate::config::ModelSettings::evaluator(),
        ));
        let evaluation = evaluator
            .evaluate(
                &FixedModel(WELL_FORMED),
                &ReflectionResponses::default(),
                "reflection",
                Tone::Gentle,
                1,
            )
            .await
            .expect("evaluate");
        assert_eq!(evaluation.text, WELL_FORMED);
        assert_eq!(evaluation.ratings.overall, Some(9));
    }
}

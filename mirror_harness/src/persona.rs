//! Synthetic persona that answers the reflection questionnaire.
//!
//! The persona is a fixed profile. Each cycle asks the completion model to
//! answer the five questions in the persona's voice and then parses the reply
//! back into labeled fields.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::llm_client::{CompletionModel, CompletionParams, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Fusion,
    Gentle,
    Intense,
}

impl Tone {
    pub const ROTATION: [Tone; 3] = [Tone::Fusion, Tone::Gentle, Tone::Intense];

    /// Tone for a 1-based cycle index.
    pub fn for_cycle(index: u32) -> Self {
        let slot = (index.max(1) - 1) as usize % Self::ROTATION.len();
        Self::ROTATION[slot]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tone::Fusion => "fusion",
            Tone::Gentle => "gentle",
            Tone::Intense => "intense",
        }
    }

    fn voice_hint(self) -> &'static str {
        match self {
            Tone::Fusion => "balanced, mixing warmth with honest challenge",
            Tone::Gentle => "soft and compassionate",
            Tone::Intense => "direct and confrontational, cutting through excuses",
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestUserProfile {
    pub name: String,
    pub email: String,
    pub tier: String,
    pub age: u32,
    pub occupation: String,
    pub personality_traits: Vec<String>,
    pub language_patterns: Vec<String>,
    pub life_situation: String,
}

impl TestUserProfile {
    pub fn alex_chen(email: impl Into<String>) -> Self {
        Self {
            name: "Alex Chen".to_string(),
            email: email.into(),
            tier: "premium".to_string(),
            age: 29,
            occupation: "Software engineer considering a move into product design".to_string(),
            personality_traits: vec![
                "analytical but quietly creative".to_string(),
                "tends to over-plan and under-start".to_string(),
                "self-deprecating when nervous".to_string(),
                "craves external validation, distrusts it when it arrives".to_string(),
                "loyal to a small circle of friends".to_string(),
            ],
            language_patterns: vec![
                "hedges with 'I guess' and 'maybe'".to_string(),
                "uses tech metaphors for feelings".to_string(),
                "writes in short bursts, then one long honest sentence".to_string(),
                "occasionally lowercase and casual".to_string(),
            ],
            life_situation: "Stable job, savings for about eight months, a partner who is \
                             supportive but risk-averse, and a half-finished design portfolio."
                .to_string(),
        }
    }

    /// Lowercase, hyphenated name ("alex-chen"), used for session file names.
    pub fn slug(&self) -> String {
        self.name
            .split_whitespace()
            .map(|part| part.to_lowercase())
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// The five questionnaire answers, as submitted to the reflection endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionResponses {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dream_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offering: Option<String>,
}

impl ReflectionResponses {
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.dream.is_none() {
            missing.push("dream");
        }
        if self.plan.is_none() {
            missing.push("plan");
        }
        if self.relationship.is_none() {
            missing.push("relationship");
        }
        if self.offering.is_none() {
            missing.push("offering");
        }
        missing
    }
}

/// Compact record of an earlier cycle, fed back into later persona prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub reflection_number: u32,
    pub tone: Tone,
    pub dream: String,
    pub rating: Option<u8>,
}

const HISTORY_WINDOW: usize = 2;
const DREAM_EXCERPT_CHARS: usize = 160;

impl HistoryEntry {
    pub fn new(
        reflection_number: u32,
        tone: Tone,
        responses: &ReflectionResponses,
        rating: Option<u8>,
    ) -> Self {
        let dream = responses.dream.as_deref().unwrap_or("(no dream given)");
        Self {
            reflection_number,
            tone,
            dream: excerpt(dream, DREAM_EXCERPT_CHARS),
            rating,
        }
    }
}

pub fn persona_system_prompt(profile: &TestUserProfile) -> String {
    format!(
        "You are {name}, a {age}-year-old. {occupation}.\n\n\
         Personality:\n{traits}\n\n\
         How you write:\n{patterns}\n\n\
         Life right now: {situation}\n\n\
         You are using a reflective journaling app called Mirror of Truth. \
         Answer its questions honestly and in your own voice. Never mention that you are an AI \
         or that this is a test.",
        name = profile.name,
        age = profile.age,
        occupation = profile.occupation,
        traits = bullet_list(&profile.personality_traits),
        patterns = bullet_list(&profile.language_patterns),
        situation = profile.life_situation,
    )
}

pub fn build_persona_prompt(
    profile: &TestUserProfile,
    tone: Tone,
    index: u32,
    history: &[HistoryEntry],
) -> String {
    let mut prompt = format!(
        "This is reflection #{index} for {name}. The mirror will answer in a {tone} tone ({hint}).\n\n",
        name = profile.name,
        tone = tone,
        hint = tone.voice_hint(),
    );

    let start = history.len().saturating_sub(HISTORY_WINDOW);
    let recent = &history[start..];
    if recent.is_empty() {
        prompt.push_str("This is your first reflection. Start with the dream that is loudest right now.\n\n");
    } else {
        prompt.push_str("Your previous reflections:\n");
        for entry in recent {
            let rating = entry
                .rating
                .map(|r| format!("{}/10", r))
                .unwrap_or_else(|| "unrated".to_string());
            prompt.push_str(&format!(
                "- Reflection #{} ({} tone, {}): {}\n",
                entry.reflection_number, entry.tone, rating, entry.dream
            ));
        }
        prompt.push_str(
            "\nLet your answers evolve from these. Go deeper, shift focus, or admit what changed.\n\n",
        );
    }

    prompt.push_str(
        "Answer the five questions below. Use exactly this format, one line per field:\n\
         DREAM: <what you dream of creating or becoming>\n\
         PLAN: <what you are actually doing about it>\n\
         DATE: <a target date, or 'none' if you have not set one>\n\
         RELATIONSHIP: <how you relate to this dream emotionally>\n\
         OFFERING: <what you are willing to give or sacrifice for it>\n",
    );
    prompt
}

const NEGATIVE_DATES: [&str; 7] = ["none", "no", "n/a", "na", "not yet", "no date", "-"];

/// Parse a persona reply into questionnaire fields.
///
/// Labels match case-insensitively anywhere in a line; the value is whatever
/// follows the first colon. A later matching line overwrites an earlier one.
pub fn parse_persona_reply(text: &str) -> ReflectionResponses {
    let mut responses = ReflectionResponses::default();

    for line in text.lines() {
        let lower = line.to_lowercase();
        let Some((_, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();

        if lower.contains("dream:") {
            responses.dream = Some(value);
        } else if lower.contains("plan:") {
            responses.plan = Some(value);
        } else if lower.contains("date:") {
            let normalized = value.trim_end_matches('.').to_ascii_lowercase();
            if value.is_empty() || NEGATIVE_DATES.contains(&normalized.as_str()) {
                responses.has_date = Some("no".to_string());
                responses.dream_date = None;
            } else {
                responses.has_date = Some("yes".to_string());
                responses.dream_date = Some(value);
            }
        } else if lower.contains("relationship:") {
            responses.relationship = Some(value);
        } else if lower.contains("offering:") {
            responses.offering = Some(value);
        }
    }

    responses
}

pub struct PersonaGenerator {
    profile: TestUserProfile,
    params: CompletionParams,
    strict_parsing: bool,
}

impl PersonaGenerator {
    pub fn new(profile: TestUserProfile, params: CompletionParams, strict_parsing: bool) -> Self {
        Self {
            profile,
            params,
            strict_parsing,
        }
    }

    pub fn profile(&self) -> &TestUserProfile {
        &self.profile
    }

    /// Returns the raw completion alongside the parsed answers.
    pub async fn generate(
        &self,
        model: &dyn CompletionModel,
        history: &[HistoryEntry],
        tone: Tone,
        index: u32,
    ) -> Result<(String, ReflectionResponses)> {
        let messages = vec![
            Message::developer(persona_system_prompt(&self.profile)),
            Message::user(build_persona_prompt(&self.profile, tone, index, history)),
        ];

        let raw = model.complete(messages, &self.params).await?;
        let responses = parse_persona_reply(&raw);

        let missing = responses.missing_fields();
        if !missing.is_empty() {
            if self.strict_parsing {
                anyhow::bail!(
                    "Persona reply for reflection #{} is missing fields: {}",
                    index,
                    missing.join(", ")
                );
            }
            tracing::warn!(
                "Persona reply for reflection #{} is missing fields: {}",
                index,
                missing.join(", ")
            );
        }

        Ok((raw, responses))
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

fn excerpt(input: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (i, ch) in input.chars().enumerate() {
        if i >= max_chars {
            out.push_str("...");
            break;
        }
        out.push(ch);
    }
    out
}

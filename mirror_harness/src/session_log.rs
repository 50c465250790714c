//! On-disk record of a harness run.
//!
//! Each run gets its own set of files in the log directory, all prefixed with
//! the session id:
//!
//! - `session.json`: the whole session document, rewritten atomically
//! - `responses.jsonl`, `reflections.jsonl`, `evaluations.jsonl`: one JSON
//!   record per line, appended as the run progresses
//! - `summary.txt`: the final report
//! - `errors.log`: one line per error

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::api::{EvolutionReport, ReflectionRecord};
use crate::evaluator::Ratings;
use crate::persona::{ReflectionResponses, Tone};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    pub session_id: String,
    pub profile_name: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reflections: Vec<ReflectionRecord>,
    #[serde(default)]
    pub evolution_report: Option<EvolutionReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseLogEntry {
    pub timestamp: DateTime<Utc>,
    pub reflection_number: u32,
    pub tone: Tone,
    pub raw_completion: String,
    pub responses: ReflectionResponses,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub reflection_number: u32,
    pub record: ReflectionRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub timestamp: DateTime<Utc>,
    pub reflection_number: u32,
    pub tone: Tone,
    pub original_responses: ReflectionResponses,
    pub mirror_reflection: String,
    pub evaluation: String,
    pub ratings: Ratings,
}

pub struct SessionLogger {
    dir: PathBuf,
    session_id: String,
    document: SessionDocument,
}

/// `{slug}-test-{timestamp}`, with `:` and `.` in the timestamp replaced by `-`.
pub fn session_id_for(profile_slug: &str, started_at: DateTime<Utc>) -> String {
    let stamp = started_at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("{}-test-{}", profile_slug, stamp)
}

impl SessionLogger {
    pub fn create(
        log_dir: impl AsRef<Path>,
        profile_slug: &str,
        profile_name: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let dir = log_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory {:?}", dir))?;

        let session_id = session_id_for(profile_slug, started_at);
        let logger = Self {
            dir,
            document: SessionDocument {
                session_id: session_id.clone(),
                profile_name: profile_name.to_string(),
                started_at,
                updated_at: started_at,
                completed_at: None,
                reflections: Vec::new(),
                evolution_report: None,
            },
            session_id,
        };
        logger.write_document()?;
        tracing::info!("Session {} logging to {:?}", logger.session_id, logger.dir);
        Ok(logger)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn document(&self) -> &SessionDocument {
        &self.document
    }

    pub fn path_for(&self, kind: &str) -> PathBuf {
        self.dir.join(format!("{}-{}", self.session_id, kind))
    }

    pub fn log_response(&self, entry: &ResponseLogEntry) -> Result<()> {
        append_json_line(&self.path_for("responses.jsonl"), entry)
    }

    pub fn log_reflection(&mut self, reflection_number: u32, record: &ReflectionRecord) -> Result<()> {
        let entry = ReflectionLogEntry {
            timestamp: Utc::now(),
            reflection_number,
            record: record.clone(),
        };
        append_json_line(&self.path_for("reflections.jsonl"), &entry)?;

        self.document.reflections.push(record.clone());
        self.document.updated_at = entry.timestamp;
        self.write_document()
    }

    pub fn log_evaluation(&self, record: &EvaluationRecord) -> Result<()> {
        append_json_line(&self.path_for("evaluations.jsonl"), record)
    }

    /// Append to `errors.log`. Failures here are traced, never returned.
    pub fn log_error(&self, context: &str, message: &str) {
        let path = self.path_for("errors.log");
        let line = format!(
            "[{}] {}: {}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            context,
            message.replace('\n', " | ")
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(error) = result {
            tracing::error!("Failed to write {:?}: {}", path, error);
        }
    }

    pub fn set_evolution_report(&mut self, report: Option<EvolutionReport>) -> Result<()> {
        self.document.evolution_report = report;
        self.document.updated_at = Utc::now();
        self.write_document()
    }

    pub fn write_summary(&self, summary: &str) -> Result<PathBuf> {
        let path = self.path_for("summary.txt");
        fs::write(&path, summary).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(path)
    }

    pub fn finish(&mut self) -> Result<()> {
        let now = Utc::now();
        self.document.completed_at = Some(now);
        self.document.updated_at = now;
        self.write_document()
    }

    fn write_document(&self) -> Result<()> {
        let path = self.path_for("session.json");
        let json = serde_json::to_string_pretty(&self.document)
            .context("Failed to serialize session document")?;
        write_atomically(&path, json.as_bytes())
    }
}

fn append_json_line<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut line = serde_json::to_string(record).context("Failed to serialize log record")?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("Failed to append to {:?}", path))
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {:?} into place", tmp))
}

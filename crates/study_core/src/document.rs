//! crates/study_core/src/document.rs
//!
//! The structured study document produced by a generation, plus the
//! cardinality limits every stored document satisfies.

use serde::{Deserialize, Serialize};

pub const MIN_BLOCKS: usize = 4;
pub const MAX_BLOCKS: usize = 12;
pub const MIN_NOTE_SECTIONS: usize = 5;
pub const MAX_NOTE_SECTIONS: usize = 10;
pub const MIN_BULLETS: usize = 1;
pub const MAX_BULLETS: usize = 8;
pub const MIN_PRACTICE_QUESTIONS: usize = 5;
pub const MAX_PRACTICE_QUESTIONS: usize = 20;
pub const MIN_SCHEDULE_DAYS: usize = 2;
pub const MAX_SCHEDULE_DAYS: usize = 14;
pub const MAX_SESSIONS_PER_DAY: usize = 8;

/// Upper bound on the serialized document, counted in characters.
pub const MAX_DOCUMENT_CHARS: usize = 24_000;

pub const MIN_BLOCK_MINUTES: u32 = 10;
pub const MAX_BLOCK_MINUTES: u32 = 180;
pub const DEFAULT_BLOCK_MINUTES: u32 = 45;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyDocument {
    pub title: String,
    pub summary: String,
    pub blocks: Vec<StudyBlock>,
    pub notes: Vec<NoteSection>,
    pub schedule: Vec<ScheduleDay>,
    pub practice_questions: Vec<PracticeQuestion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyBlock {
    pub title: String,
    pub description: String,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSection {
    pub heading: String,
    pub bullets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDay {
    /// 1-based day number.
    pub day: u32,
    pub sessions: Vec<ScheduledSession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSession {
    pub title: String,
    /// `HH:MM`, 24-hour clock.
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PracticeQuestion {
    pub question: String,
    pub answer: String,
}

impl StudyDocument {
    /// Length of the serialized JSON in characters.
    pub fn serialized_chars(&self) -> usize {
        serde_json::to_string(self)
            .map(|s| s.chars().count())
            .unwrap_or(usize::MAX)
    }

    /// Checks every documented minimum and maximum.
    pub fn meets_cardinality(&self) -> bool {
        (MIN_BLOCKS..=MAX_BLOCKS).contains(&self.blocks.len())
            && (MIN_NOTE_SECTIONS..=MAX_NOTE_SECTIONS).contains(&self.notes.len())
            && self
                .notes
                .iter()
                .all(|n| (MIN_BULLETS..=MAX_BULLETS).contains(&n.bullets.len()))
            && (MIN_SCHEDULE_DAYS..=MAX_SCHEDULE_DAYS).contains(&self.schedule.len())
            && self
                .schedule
                .iter()
                .all(|d| (1..=MAX_SESSIONS_PER_DAY).contains(&d.sessions.len()))
            && (MIN_PRACTICE_QUESTIONS..=MAX_PRACTICE_QUESTIONS)
                .contains(&self.practice_questions.len())
    }

    /// JSON schema sent to the model as the response contract.
    pub fn json_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "additionalProperties": false,
            "required": ["title", "summary", "blocks", "notes", "schedule", "practice_questions"],
            "properties": {
                "title": { "type": "string" },
                "summary": { "type": "string" },
                "blocks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["title", "description", "duration_minutes"],
                        "properties": {
                            "title": { "type": "string" },
                            "description": { "type": "string" },
                            "duration_minutes": { "type": "integer" }
                        }
                    }
                },
                "notes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["heading", "bullets"],
                        "properties": {
                            "heading": { "type": "string" },
                            "bullets": { "type": "array", "items": { "type": "string" } }
                        }
                    }
                },
                "schedule": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["day", "sessions"],
                        "properties": {
                            "day": { "type": "integer" },
                            "sessions": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "additionalProperties": false,
                                    "required": ["title", "start", "end"],
                                    "properties": {
                                        "title": { "type": "string" },
                                        "start": { "type": "string" },
                                        "end": { "type": "string" }
                                    }
                                }
                            }
                        }
                    }
                },
                "practice_questions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["question", "answer"],
                        "properties": {
                            "question": { "type": "string" },
                            "answer": { "type": "string" }
                        }
                    }
                }
            }
        })
    }
}

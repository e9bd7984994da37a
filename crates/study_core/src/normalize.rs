//! crates/study_core/src/normalize.rs
//!
//! Turns arbitrary model output into a structurally valid [`StudyDocument`].
//!
//! `normalize` is total: whatever JSON value it gets (including `null`), it returns a
//! document that meets every cardinality in [`crate::document`] and fits in
//! [`MAX_DOCUMENT_CHARS`]. Per substructure it coerces and trims, drops entries that
//! miss required fields, pads from the localized templates up to the minimum and
//! truncates past the maximum. The character budget is enforced last.

use serde_json::{Map, Value};

use crate::document::*;
use crate::language::{mentions_imminent_deadline, topic_from_prompt, Language};
use crate::schedule::{self, format_clock, parse_clock};

const TITLE_MAX: usize = 120;
const SUMMARY_MAX: usize = 600;
const BLOCK_TITLE_MAX: usize = 120;
const BLOCK_DESCRIPTION_MAX: usize = 600;
const HEADING_MAX: usize = 120;
const BULLET_MAX: usize = 400;
const QUESTION_MAX: usize = 400;
const ANSWER_MAX: usize = 1200;

/// Budget trimming never shortens a field below this.
const TRIM_FLOOR: usize = 40;
const TITLE_TRIM_FLOOR: usize = 16;

//=========================================================================================
// Entry points
//=========================================================================================

/// Normalizes a parsed model response. Never fails.
pub fn normalize(raw: &Value, language: Language, prompt: &str) -> StudyDocument {
    normalize_with_budget(raw, language, prompt, MAX_DOCUMENT_CHARS)
}

/// Same as [`normalize`] with an explicit character budget.
pub fn normalize_with_budget(
    raw: &Value,
    language: Language,
    prompt: &str,
    budget: usize,
) -> StudyDocument {
    let empty = Map::new();
    let root = raw.as_object().unwrap_or(&empty);
    let topic = topic_from_prompt(prompt, language);

    let title = field(root, &["title", "name"])
        .and_then(|v| coerce_text(v, TITLE_MAX))
        .unwrap_or_else(|| truncate_chars(&language.fallback_title(&topic), TITLE_MAX));
    let summary = field(root, &["summary", "overview", "description"])
        .and_then(|v| coerce_text(v, SUMMARY_MAX))
        .unwrap_or_else(|| truncate_chars(&language.fallback_summary(&topic), SUMMARY_MAX));

    let blocks = normalize_blocks(field(root, &["blocks", "study_blocks"]), language);
    let notes = normalize_notes(field(root, &["notes", "note_sections"]), language);
    let practice_questions = normalize_practice(
        field(root, &["practice_questions", "questions", "practice"]),
        language,
        &topic,
    );

    let schedule = field(root, &["schedule", "days"])
        .and_then(normalize_schedule)
        .unwrap_or_else(|| schedule::synthesize(&blocks, mentions_imminent_deadline(prompt)));

    let mut document = StudyDocument {
        title,
        summary,
        blocks,
        notes,
        schedule,
        practice_questions,
    };
    enforce_budget(&mut document, budget);
    document
}

/// Parses raw model text into JSON, tolerating Markdown code fences and leading chatter.
pub fn parse_model_json(raw: &str) -> Result<Value, String> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    match serde_json::from_str::<Value>(unfenced) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            let start = unfenced.find('{');
            let end = unfenced.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if s < e => serde_json::from_str::<Value>(&unfenced[s..=e])
                    .map_err(|e| format!("response is not valid JSON: {}", e)),
                _ => Err(format!("response is not valid JSON: {}", first_err)),
            }
        }
    }
}

/// Strict structural check applied before normalization in the generation pipeline.
/// A failure here triggers the repair attempt.
pub fn check_shape(value: &Value) -> Result<(), String> {
    let root = value
        .as_object()
        .ok_or_else(|| "top-level value is not an object".to_string())?;

    match root.get("title") {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        _ => return Err("`title` must be a non-empty string".to_string()),
    }
    for key in ["blocks", "notes", "practice_questions"] {
        match root.get(key) {
            Some(Value::Array(items)) if !items.is_empty() => {}
            _ => return Err(format!("`{}` must be a non-empty array", key)),
        }
    }
    Ok(())
}

//=========================================================================================
// Substructures
//=========================================================================================

fn normalize_blocks(raw: Option<&Value>, language: Language) -> Vec<StudyBlock> {
    let mut blocks: Vec<StudyBlock> = as_items(raw)
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let title = field(obj, &["title", "name"]).and_then(|v| coerce_text(v, BLOCK_TITLE_MAX))?;
            let description = field(obj, &["description", "details", "content"])
                .and_then(|v| coerce_text(v, BLOCK_DESCRIPTION_MAX))?;
            let duration_minutes = coerce_minutes(field(obj, &["duration_minutes", "duration", "minutes"]));
            Some(StudyBlock {
                title,
                description,
                duration_minutes,
            })
        })
        .take(MAX_BLOCKS)
        .collect();

    let templates = language.block_templates();
    let mut n = 0;
    while blocks.len() < MIN_BLOCKS {
        let (title, description) = templates[n % templates.len()];
        let title = padded_title(title, n / templates.len(), language);
        n += 1;
        if blocks.iter().any(|b| b.title.eq_ignore_ascii_case(&title)) {
            continue;
        }
        blocks.push(StudyBlock {
            title,
            description: description.to_string(),
            duration_minutes: DEFAULT_BLOCK_MINUTES,
        });
    }
    blocks
}

fn normalize_notes(raw: Option<&Value>, language: Language) -> Vec<NoteSection> {
    // Models sometimes answer with `{ "heading": ["bullet", ...] }` instead of a list.
    let items: Vec<(Option<String>, Option<&Value>)> = match raw {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| (coerce_text(&Value::String(k.clone()), HEADING_MAX), Some(v)))
            .collect(),
        _ => as_items(raw)
            .iter()
            .filter_map(|item| item.as_object())
            .map(|obj| {
                (
                    field(obj, &["heading", "title", "label"]).and_then(|v| coerce_text(v, HEADING_MAX)),
                    field(obj, &["bullets", "items", "points", "content"]),
                )
            })
            .collect(),
    };

    let mut notes: Vec<NoteSection> = items
        .into_iter()
        .filter_map(|(heading, bullets)| {
            let heading = heading?;
            let bullets: Vec<String> = match bullets {
                Some(Value::Array(list)) => list
                    .iter()
                    .filter_map(|b| coerce_text(b, BULLET_MAX))
                    .take(MAX_BULLETS)
                    .collect(),
                Some(other) => coerce_text(other, BULLET_MAX).into_iter().collect(),
                None => Vec::new(),
            };
            if bullets.len() < MIN_BULLETS {
                return None;
            }
            Some(NoteSection { heading, bullets })
        })
        .take(MAX_NOTE_SECTIONS)
        .collect();

    let templates = language.note_templates();
    let mut n = 0;
    while notes.len() < MIN_NOTE_SECTIONS {
        let (heading, bullet) = templates[n % templates.len()];
        let heading = padded_title(heading, n / templates.len(), language);
        n += 1;
        if notes.iter().any(|s| s.heading.eq_ignore_ascii_case(&heading)) {
            continue;
        }
        notes.push(NoteSection {
            heading,
            bullets: vec![bullet.to_string()],
        });
    }
    notes
}

fn normalize_practice(raw: Option<&Value>, language: Language, topic: &str) -> Vec<PracticeQuestion> {
    let mut questions: Vec<PracticeQuestion> = as_items(raw)
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let question = field(obj, &["question", "prompt", "q"]).and_then(|v| coerce_text(v, QUESTION_MAX))?;
            let answer = field(obj, &["answer", "solution", "a"]).and_then(|v| coerce_text(v, ANSWER_MAX))?;
            Some(PracticeQuestion { question, answer })
        })
        .take(MAX_PRACTICE_QUESTIONS)
        .collect();

    let templates = language.practice_templates();
    let mut n = 0;
    while questions.len() < MIN_PRACTICE_QUESTIONS {
        let (question, answer) = templates[n % templates.len()];
        let question = padded_title(&question.replace("{topic}", topic), n / templates.len(), language);
        n += 1;
        if questions.iter().any(|q| q.question == question) {
            continue;
        }
        questions.push(PracticeQuestion {
            question: truncate_chars(&question, QUESTION_MAX),
            answer: answer.to_string(),
        });
    }
    questions
}

/// Keeps a model-supplied schedule only if it still spans enough days after cleanup.
fn normalize_schedule(raw: &Value) -> Option<Vec<ScheduleDay>> {
    let days: Vec<ScheduleDay> = raw
        .as_array()?
        .iter()
        .filter_map(|day| {
            let obj = day.as_object()?;
            let sessions: Vec<ScheduledSession> = as_items(field(obj, &["sessions", "blocks", "items"]))
                .iter()
                .filter_map(|s| {
                    let s = s.as_object()?;
                    let title = field(s, &["title", "name"]).and_then(|v| coerce_text(v, BLOCK_TITLE_MAX))?;
                    let start = field(s, &["start"]).and_then(Value::as_str).and_then(parse_clock)?;
                    let end = field(s, &["end"]).and_then(Value::as_str).and_then(parse_clock)?;
                    (end > start).then(|| ScheduledSession {
                        title,
                        start: format_clock(start),
                        end: format_clock(end),
                    })
                })
                .take(MAX_SESSIONS_PER_DAY)
                .collect();
            (!sessions.is_empty()).then_some(sessions)
        })
        .take(MAX_SCHEDULE_DAYS)
        .enumerate()
        .map(|(i, sessions)| ScheduleDay {
            day: i as u32 + 1,
            sessions,
        })
        .collect();

    (days.len() >= MIN_SCHEDULE_DAYS).then_some(days)
}

//=========================================================================================
// Character budget
//=========================================================================================

/// Free-text classes in the order they are shortened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrimClass {
    NoteBullets,
    PracticeAnswers,
    BlockDescriptions,
    Title,
    Summary,
    PracticeQuestions,
    NoteHeadings,
    BlockTitles,
}

const TRIM_ORDER: [TrimClass; 8] = [
    TrimClass::NoteBullets,
    TrimClass::PracticeAnswers,
    TrimClass::BlockDescriptions,
    TrimClass::Title,
    TrimClass::Summary,
    TrimClass::PracticeQuestions,
    TrimClass::NoteHeadings,
    TrimClass::BlockTitles,
];

impl TrimClass {
    fn floor(&self) -> usize {
        match self {
            TrimClass::Title => TITLE_TRIM_FLOOR,
            _ => TRIM_FLOOR,
        }
    }

    fn fields<'a>(&self, doc: &'a mut StudyDocument) -> Vec<&'a mut String> {
        match self {
            TrimClass::NoteBullets => doc.notes.iter_mut().flat_map(|n| n.bullets.iter_mut()).collect(),
            TrimClass::PracticeAnswers => doc.practice_questions.iter_mut().map(|q| &mut q.answer).collect(),
            TrimClass::BlockDescriptions => doc.blocks.iter_mut().map(|b| &mut b.description).collect(),
            TrimClass::Title => vec![&mut doc.title],
            TrimClass::Summary => vec![&mut doc.summary],
            TrimClass::PracticeQuestions => doc.practice_questions.iter_mut().map(|q| &mut q.question).collect(),
            TrimClass::NoteHeadings => doc.notes.iter_mut().map(|n| &mut n.heading).collect(),
            TrimClass::BlockTitles => doc
                .blocks
                .iter_mut()
                .map(|b| &mut b.title)
                .chain(doc.schedule.iter_mut().flat_map(|d| d.sessions.iter_mut().map(|s| &mut s.title)))
                .collect(),
        }
    }
}

/// Shortens free text, longest field first within each class, until the serialized
/// document fits. Only string content changes; no entry is removed.
fn enforce_budget(doc: &mut StudyDocument, budget: usize) {
    for class in TRIM_ORDER {
        loop {
            let size = doc.serialized_chars();
            if size <= budget {
                return;
            }
            let over = size - budget;
            let floor = class.floor();

            let mut fields = class.fields(doc);
            let longest = fields
                .iter()
                .enumerate()
                .map(|(i, f)| (i, f.chars().count()))
                .filter(|(_, len)| *len > floor)
                .fold(None, |best: Option<(usize, usize)>, cur| match best {
                    Some(b) if b.1 >= cur.1 => Some(b),
                    _ => Some(cur),
                });

            let Some((index, len)) = longest else { break };
            let target = len.saturating_sub(over).max(floor);
            let shortened = truncate_chars(fields[index].as_str(), target);
            *fields[index] = shortened;
        }
    }
}

//=========================================================================================
// Coercion helpers
//=========================================================================================

fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k)).filter(|v| !v.is_null())
}

fn as_items(raw: Option<&Value>) -> &[Value] {
    match raw {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

/// Strings, numbers and booleans become cleaned text; anything else is rejected.
fn coerce_text(value: &Value, max_chars: usize) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    let cleaned = raw
        .split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if cleaned.is_empty() {
        return None;
    }
    Some(truncate_chars(&cleaned, max_chars))
}

fn coerce_minutes(value: Option<&Value>) -> u32 {
    let minutes = match value {
        Some(Value::Number(n)) => n.as_f64().map(|f| f.round()),
        Some(Value::String(s)) => {
            let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<f64>().ok()
        }
        _ => None,
    };
    match minutes {
        Some(m) if m.is_finite() && m > 0.0 => {
            (m.min(MAX_BLOCK_MINUTES as f64) as u32).max(MIN_BLOCK_MINUTES)
        }
        _ => DEFAULT_BLOCK_MINUTES,
    }
}

fn padded_title(base: &str, round: usize, language: Language) -> String {
    if round == 0 {
        base.to_string()
    } else {
        format!("{}{}", base, language.repeat_suffix(round))
    }
}

/// Cuts `text` to at most `max_chars` characters, marking the cut with `…`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut cut: String = text.chars().take(max_chars - 1).collect();
    cut.truncate(cut.trim_end().len());
    cut.push('…');
    cut
}

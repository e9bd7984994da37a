//! crates/study_core/src/schedule.rs
//!
//! Deterministic day-by-day schedule synthesis from a block list.

use crate::document::{ScheduleDay, ScheduledSession, StudyBlock, MAX_SCHEDULE_DAYS};

/// Every day starts at 09:00.
pub const DAY_START_MINUTES: u32 = 9 * 60;
pub const BLOCKS_PER_DAY: usize = 2;
/// Upper bound on the first day's share when a deadline is imminent.
pub const DENSE_FIRST_DAY_MAX: usize = 4;
const LAST_MINUTE_OF_DAY: u32 = 24 * 60 - 1;

/// How many blocks each day receives.
///
/// In dense mode the first day takes about two thirds of the blocks (at least two,
/// at most four) while leaving at least one block for later days.
pub fn day_sizes(block_count: usize, dense: bool) -> Vec<usize> {
    if block_count == 0 {
        return Vec::new();
    }
    if block_count == 1 {
        return vec![1];
    }

    let first = if dense {
        let two_thirds = (block_count * 2).div_ceil(3);
        two_thirds.clamp(2, DENSE_FIRST_DAY_MAX).min(block_count - 1)
    } else {
        BLOCKS_PER_DAY.min(block_count - 1)
    };

    let mut sizes = vec![first];
    let mut remaining = block_count - first;
    while remaining > 0 {
        let take = BLOCKS_PER_DAY.min(remaining);
        sizes.push(take);
        remaining -= take;
    }

    // Fold any overflow into the last allowed day.
    if sizes.len() > MAX_SCHEDULE_DAYS {
        let overflow: usize = sizes.drain(MAX_SCHEDULE_DAYS..).sum();
        if let Some(last) = sizes.last_mut() {
            *last += overflow;
        }
    }
    sizes
}

/// Packs blocks into days, accumulating each block's duration from the day start.
pub fn synthesize(blocks: &[StudyBlock], dense: bool) -> Vec<ScheduleDay> {
    let mut days = Vec::new();
    let mut cursor = 0;

    for (index, size) in day_sizes(blocks.len(), dense).into_iter().enumerate() {
        let mut clock = DAY_START_MINUTES;
        let sessions = blocks[cursor..cursor + size]
            .iter()
            .map(|block| {
                let start = clock;
                let end = (start + block.duration_minutes).min(LAST_MINUTE_OF_DAY);
                clock = end;
                ScheduledSession {
                    title: block.title.clone(),
                    start: format_clock(start),
                    end: format_clock(end),
                }
            })
            .collect();
        cursor += size;
        days.push(ScheduleDay {
            day: index as u32 + 1,
            sessions,
        });
    }
    days
}

pub fn format_clock(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Parses `H:MM` or `HH:MM` into minutes after midnight.
pub fn parse_clock(value: &str) -> Option<u32> {
    let (h, m) = value.trim().split_once(':')?;
    if m.len() != 2 || h.is_empty() || h.len() > 2 {
        return None;
    }
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

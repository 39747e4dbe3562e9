use anyhow::{anyhow, Result};
use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// How an update waiting in the ready state is released.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ScheduleType {
    /// Start the update as soon as it is ready.
    #[default]
    Force,
    /// Wait for an explicit start request.
    Trigger,
    /// Start inside the next open timetable window.
    Timetable,
}

/// One weekly update window. Days follow ISO numbering: 1 is Monday,
/// 7 is Sunday. Times are local, "HH:MM".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlot {
    pub day_of_week: u32,
    pub start: String,
    pub finish: String,
}

/// Update schedule carried by a desired-state document. A zero TTL selects
/// the configured default update lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRule {
    #[serde(rename = "type", default)]
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timetable: Vec<TimeSlot>,
}

impl ScheduleRule {
    pub fn validate(&self) -> Result<()> {
        if self.schedule_type == ScheduleType::Timetable {
            validate_timetable(&self.timetable)?;
        }

        Ok(())
    }
}

pub fn validate_timetable(timetable: &[TimeSlot]) -> Result<()> {
    if timetable.is_empty() {
        return Err(anyhow!("timetable is empty"));
    }

    for slot in timetable {
        if !(1..=7).contains(&slot.day_of_week) {
            return Err(anyhow!("invalid day of week: {}", slot.day_of_week));
        }

        let (start, finish) = parse_slot_times(slot)?;

        if start >= finish {
            return Err(anyhow!(
                "timetable start {} is not before finish {}",
                slot.start,
                slot.finish
            ));
        }
    }

    Ok(())
}

/// Returns the next instant an update window opens, searching the coming
/// seven days. `now` itself is returned when it already falls inside a
/// window. `None` means the timetable never opens, which only happens for
/// an invalid timetable.
pub fn next_window(now: NaiveDateTime, timetable: &[TimeSlot]) -> Option<NaiveDateTime> {
    let mut next: Option<NaiveDateTime> = None;

    for day_offset in 0..7i64 {
        let date = now.date() + Duration::days(day_offset);
        let weekday = date.weekday().number_from_monday();

        for slot in timetable {
            if slot.day_of_week != weekday {
                continue;
            }

            let Ok((start, finish)) = parse_slot_times(slot) else {
                continue;
            };

            let window_start = date.and_time(start);
            let window_finish = date.and_time(finish);

            if now >= window_start && now < window_finish {
                return Some(now);
            }

            if window_start > now && next.map(|cur| window_start < cur).unwrap_or(true) {
                next = Some(window_start);
            }
        }

        if next.is_some() {
            break;
        }
    }

    next
}

fn parse_slot_times(slot: &TimeSlot) -> Result<(NaiveTime, NaiveTime)> {
    let start = NaiveTime::parse_from_str(&slot.start, "%H:%M")
        .map_err(|err| anyhow!("invalid start time {}: {}", slot.start, err))?;
    let finish = NaiveTime::parse_from_str(&slot.finish, "%H:%M")
        .map_err(|err| anyhow!("invalid finish time {}: {}", slot.finish, err))?;

    Ok((start, finish))
}

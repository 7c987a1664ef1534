//! Synthetic event builders for tests
//!
//! Day 0 is Monday 2024-01-01 (UTC).

use crate::events::types::{EventType, HealthEvent};
use chrono::{DateTime, Duration, TimeZone, Utc};

/// Monday 2024-01-01 00:00 UTC plus an offset
pub fn at(day: i64, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        + Duration::days(day)
        + Duration::hours(hour as i64)
        + Duration::minutes(minute as i64)
}

pub fn meal(user_id: &str, food: &str, occurred_at: DateTime<Utc>) -> HealthEvent {
    HealthEvent::new(user_id, EventType::Meal, occurred_at).with("food", food)
}

pub fn symptom(user_id: &str, name: &str, occurred_at: DateTime<Utc>) -> HealthEvent {
    HealthEvent::new(user_id, EventType::Symptom, occurred_at).with("name", name)
}

pub fn mood(user_id: &str, value: &str, occurred_at: DateTime<Utc>) -> HealthEvent {
    HealthEvent::new(user_id, EventType::Mood, occurred_at).with("mood", value)
}

pub fn exercise(user_id: &str, activity: &str, occurred_at: DateTime<Utc>) -> HealthEvent {
    HealthEvent::new(user_id, EventType::Exercise, occurred_at).with("activity", activity)
}

/// 90 days with 20 pasta lunches; 18 of them are followed by tiredness
/// three hours later. Lunch days are spread so no weekday dominates.
pub fn pasta_tiredness_events(user_id: &str) -> Vec<HealthEvent> {
    let mut events = Vec::new();
    for i in 0..20i64 {
        let day = i * 9 / 2;
        let lunch = at(day, 12, 0);
        events.push(meal(user_id, "pasta", lunch));
        if i < 18 {
            events.push(symptom(user_id, "tiredness", lunch + Duration::hours(3)).with("severity", 6.0));
        }
    }
    // Unrelated logging on other days keeps the span at 90 days
    events.push(meal(user_id, "salad", at(0, 8, 0)));
    events.push(meal(user_id, "salad", at(89, 8, 0)));
    events.sort_by_key(|e| e.occurred_at);
    events
}

/// A 15:00 craving on 8 consecutive Tuesdays and on no other weekday
pub fn tuesday_craving_events(user_id: &str) -> Vec<HealthEvent> {
    (0..8i64)
        .map(|week| symptom(user_id, "craving", at(1 + week * 7, 15, 0)))
        .collect()
}

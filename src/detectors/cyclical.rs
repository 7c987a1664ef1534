//! Cyclical Pattern Finder
//!
//! Groups each class's occurrences by local weekday (and optionally by day
//! of month). A calendar slot becomes a pattern when the class shows up on
//! at least `min_recurrence_rate` of that slot's dates, over at least
//! `min_cycles` dates, and the hit count is unlikely under the class's
//! overall daily rate (one-sided binomial test).
//!
//! Weekly rhythms accrue one observation per week, so `min_cycles` stands
//! in for the general occurrence threshold here.

use crate::detectors::PatternDetector;
use crate::events::{EventClass, EventTimeline};
use crate::patterns::{
    CalendarSlot, ClassRef, PatternCandidate, PatternRule, PatternType, RuleStatistics,
    TimeWindow, TriggerSpec,
};
use crate::stats::{self, SignificanceGate};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Cyclical detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CyclicalConfig {
    /// Share of slot dates the class must appear on
    #[serde(default = "default_min_recurrence_rate")]
    pub min_recurrence_rate: f64,

    /// Minimum number of slot dates observed
    #[serde(default = "default_min_cycles")]
    pub min_cycles: u64,

    /// Also look for day-of-month recurrences
    #[serde(default)]
    pub include_day_of_month: bool,
}

fn default_min_recurrence_rate() -> f64 {
    0.75
}

fn default_min_cycles() -> u64 {
    6
}

impl Default for CyclicalConfig {
    fn default() -> Self {
        Self {
            min_recurrence_rate: default_min_recurrence_rate(),
            min_cycles: default_min_cycles(),
            include_day_of_month: false,
        }
    }
}

impl CalendarSlot {
    /// Whether a local date falls on this slot
    pub fn matches(&self, date: NaiveDate) -> bool {
        match self {
            CalendarSlot::Weekday { weekday } => date.weekday() == *weekday,
            CalendarSlot::DayOfMonth { day } => date.day() == *day,
        }
    }
}

/// Finds weekday and day-of-month recurrences
#[derive(Debug, Clone)]
pub struct CyclicalDetector {
    config: CyclicalConfig,
    gate: SignificanceGate,
}

impl CyclicalDetector {
    pub fn new(config: CyclicalConfig, gate: SignificanceGate) -> Self {
        Self { config, gate }
    }

    fn slots(&self) -> Vec<CalendarSlot> {
        let mut slots: Vec<CalendarSlot> = WEEKDAYS
            .iter()
            .map(|weekday| CalendarSlot::Weekday { weekday: *weekday })
            .collect();
        if self.config.include_day_of_month {
            slots.extend((1..=31).map(|day| CalendarSlot::DayOfMonth { day }));
        }
        slots
    }

    fn evaluate(
        &self,
        timeline: &EventTimeline,
        class: &EventClass,
        slot: CalendarSlot,
        dates: &[NaiveDate],
        class_dates: &BTreeSet<NaiveDate>,
    ) -> Option<PatternCandidate> {
        let cycles: Vec<NaiveDate> = dates.iter().copied().filter(|d| slot.matches(*d)).collect();
        let cycle_count = cycles.len() as u64;
        if cycle_count < self.config.min_cycles {
            return None;
        }

        let hit_dates: BTreeSet<NaiveDate> = cycles
            .iter()
            .copied()
            .filter(|d| class_dates.contains(d))
            .collect();
        let hits = hit_dates.len() as u64;
        let rate = hits as f64 / cycle_count as f64;
        if rate < self.config.min_recurrence_rate {
            return None;
        }

        let base_rate = class_dates.len() as f64 / dates.len().max(1) as f64;
        let p_value = match stats::binomial_upper_tail(hits, cycle_count, base_rate.min(1.0)) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, class = %class.label, "Binomial test failed");
                return None;
            }
        };
        if !self.gate.is_significant(p_value) {
            return None;
        }

        tracing::debug!(
            class = %class.label,
            slot = %slot,
            hits,
            cycles = cycle_count,
            p_value,
            "Cyclical pattern found"
        );

        Some(PatternCandidate {
            rule: PatternRule {
                pattern_type: PatternType::Cyclical,
                trigger: TriggerSpec::Calendar { slot },
                outcome: ClassRef::from(class),
                window: TimeWindow::CalendarDay,
                statistics: RuleStatistics {
                    p_value,
                    occurrences: hits,
                    trials: cycle_count,
                    trigger_rate: rate,
                    baseline_rate: base_rate,
                    rate_interval: stats::confidence_interval(hits, cycle_count, 1.96),
                    recurrence_rate: Some(rate),
                    typical_hour: typical_hour(timeline, class, &hit_dates),
                    outcome_severity: timeline.mean_severity(&class.key),
                    period_days: timeline.span_days(),
                    ..Default::default()
                },
            },
            positive: hits,
            negative: cycle_count - hits,
        })
    }
}

impl PatternDetector for CyclicalDetector {
    fn name(&self) -> &'static str {
        "cyclical"
    }

    fn detect(&self, timeline: &EventTimeline, until: DateTime<Utc>) -> Vec<PatternCandidate> {
        let dates: Vec<NaiveDate> = timeline
            .dates()
            .into_iter()
            .filter(|d| timeline.end_of_local_day(*d).is_some_and(|end| end <= until))
            .collect();
        if dates.is_empty() {
            return Vec::new();
        }
        let analysed: BTreeSet<NaiveDate> = dates.iter().copied().collect();
        let slots = self.slots();

        let mut candidates = Vec::new();
        for class in timeline.classes().values() {
            let class_dates: BTreeSet<NaiveDate> = timeline
                .dates_of(&class.key)
                .intersection(&analysed)
                .copied()
                .collect();
            if class_dates.is_empty() {
                continue;
            }

            for slot in &slots {
                if let Some(candidate) = self.evaluate(timeline, class, *slot, &dates, &class_dates) {
                    candidates.push(candidate);
                }
            }
        }

        candidates
    }
}

/// Median local hour of the class's occurrences on the given dates
fn typical_hour(
    timeline: &EventTimeline,
    class: &EventClass,
    dates: &BTreeSet<NaiveDate>,
) -> Option<u32> {
    let tz = timeline.tz();
    let mut hours: Vec<u32> = timeline
        .times(&class.key)
        .iter()
        .map(|t| t.with_timezone(&tz))
        .filter(|local| dates.contains(&local.date_naive()))
        .map(|local| local.hour())
        .collect();
    hours.sort_unstable();
    hours.get(hours.len() / 2).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::*;
    use crate::events::EventGrouper;

    fn detector(config: CyclicalConfig) -> CyclicalDetector {
        CyclicalDetector::new(config, SignificanceGate::default())
    }

    #[test]
    fn test_tuesday_craving_scenario() {
        let events = tuesday_craving_events("u1");
        let timeline = EventTimeline::build(&events, &EventGrouper::default(), chrono_tz::UTC);

        let candidates = detector(CyclicalConfig::default()).detect(&timeline, at(60, 0, 0));

        assert_eq!(candidates.len(), 1);
        let rule = &candidates[0].rule;
        assert_eq!(rule.pattern_type, PatternType::Cyclical);
        assert_eq!(
            rule.trigger,
            TriggerSpec::Calendar {
                slot: CalendarSlot::Weekday {
                    weekday: Weekday::Tue
                }
            }
        );
        assert_eq!(rule.outcome.label, "craving");
        assert!(rule.statistics.recurrence_rate.is_some_and(|r| r >= 0.75));
        assert_eq!(rule.statistics.occurrences, 8);
        assert_eq!(rule.statistics.typical_hour, Some(15));
        assert!(rule.statistics.p_value < 0.05);
    }

    #[test]
    fn test_weekday_follows_user_timezone() {
        // 03:00 UTC Tuesday is still Monday evening in Los Angeles
        let events: Vec<_> = (0..8)
            .map(|week| symptom("u1", "craving", at(1 + week * 7, 3, 0)))
            .collect();
        let timeline = EventTimeline::build(
            &events,
            &EventGrouper::default(),
            chrono_tz::America::Los_Angeles,
        );

        let candidates = detector(CyclicalConfig::default()).detect(&timeline, at(60, 0, 0));
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].rule.trigger,
            TriggerSpec::Calendar {
                slot: CalendarSlot::Weekday {
                    weekday: Weekday::Mon
                }
            }
        );
        assert_eq!(candidates[0].rule.statistics.typical_hour, Some(19));
    }

    #[test]
    fn test_daily_habit_is_not_cyclical() {
        let events: Vec<_> = (0..56).map(|day| meal("u1", "coffee", at(day, 8, 0))).collect();
        let timeline = EventTimeline::build(&events, &EventGrouper::default(), chrono_tz::UTC);

        assert!(detector(CyclicalConfig::default())
            .detect(&timeline, at(60, 0, 0))
            .is_empty());
    }

    #[test]
    fn test_too_few_cycles() {
        let events: Vec<_> = (0..5)
            .map(|week| symptom("u1", "craving", at(1 + week * 7, 15, 0)))
            .collect();
        let timeline = EventTimeline::build(&events, &EventGrouper::default(), chrono_tz::UTC);

        assert!(detector(CyclicalConfig::default())
            .detect(&timeline, at(60, 0, 0))
            .is_empty());
    }

    #[test]
    fn test_day_of_month() {
        // The 15th of every month for eight months, plus scattered noise
        let mut events = Vec::new();
        let mut date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        for _ in 0..8 {
            let at = date.and_hms_opt(9, 0, 0).unwrap().and_utc();
            events.push(symptom("u1", "migraine", at));
            date = date.checked_add_months(chrono::Months::new(1)).unwrap();
        }
        events.push(meal("u1", "toast", at(0, 8, 0)));

        let timeline = EventTimeline::build(&events, &EventGrouper::default(), chrono_tz::UTC);
        let config = CyclicalConfig {
            include_day_of_month: true,
            ..Default::default()
        };
        let candidates = detector(config).detect(&timeline, at(400, 0, 0));

        assert!(candidates.iter().any(|c| c.rule.trigger
            == TriggerSpec::Calendar {
                slot: CalendarSlot::DayOfMonth { day: 15 }
            }));
    }
}

//! Insight Generator
//!
//! Renders a short, human-readable sentence for each pattern: what the
//! trigger and outcome are, the time window, how often it held, and one
//! thing the user could try.

use crate::events::EventType;
use crate::patterns::types::{
    trim_float, ClassRef, DiscoveredPattern, PatternRule, PatternType, TimeWindow, TriggerSpec,
};

/// Insight text for a stored pattern
pub fn generate_actionable_insight(pattern: &DiscoveredPattern) -> String {
    render_insight(&pattern.pattern_rule)
}

/// Insight text for a rule, keyed by its pattern type
pub fn render_insight(rule: &PatternRule) -> String {
    let stats = &rule.statistics;
    let trigger = rule.trigger.describe();
    let outcome = rule.outcome.label.as_str();
    let percent = percentage(stats.trigger_rate);
    let action = suggested_action(rule);

    let observation = match rule.pattern_type {
        PatternType::TemporalCorrelation | PatternType::SemanticCluster => format!(
            "{} {} followed by {} {} {}% of the time ({} of {} times, vs {}% otherwise).",
            capitalize(&trigger),
            if matches!(rule.trigger, TriggerSpec::Cluster { .. }) {
                "are"
            } else {
                "is"
            },
            outcome,
            window_phrase(&rule.window),
            percent,
            stats.occurrences,
            stats.trials,
            percentage(stats.baseline_rate),
        ),
        PatternType::MultiFactor => format!(
            "On days with {}, you report {} {}% of the time ({} of {} days, vs {}% on other days).",
            trigger,
            outcome,
            percent,
            stats.occurrences,
            stats.trials,
            percentage(stats.baseline_rate),
        ),
        PatternType::Sequence => format!(
            "The sequence {} → {} repeated {} times {}, completing {}% of the times it started.",
            trigger,
            outcome,
            stats.occurrences,
            window_phrase(&rule.window),
            percent,
        ),
        PatternType::Cyclical => {
            let rate = stats.recurrence_rate.unwrap_or(stats.trigger_rate);
            let hour = stats
                .typical_hour
                .map(|h| format!(", usually around {:02}:00", h))
                .unwrap_or_default();
            format!(
                "{} tends to show up on {} {}% of the time ({} of {}){}.",
                capitalize(outcome),
                trigger,
                percentage(rate),
                stats.occurrences,
                stats.trials,
                hour,
            )
        }
    };

    format!("{} {}", observation, action)
}

fn window_phrase(window: &TimeWindow) -> String {
    match window {
        TimeWindow::Hours { .. } => format!("within {}", window),
        TimeWindow::SameDay => "on the same day".to_string(),
        TimeWindow::Gap { max_gap_hours } => {
            format!("with at most {}h between steps", trim_float(*max_gap_hours))
        }
        TimeWindow::CalendarDay => "on that day".to_string(),
    }
}

fn suggested_action(rule: &PatternRule) -> String {
    let trigger = rule.trigger.describe();
    let outcome = rule.outcome.label.as_str();

    if let TriggerSpec::Calendar { slot } = &rule.trigger {
        return format!(
            "Try planning something supportive ahead of {} to get ahead of the {}.",
            slot, outcome
        );
    }

    let primary = primary_class(&rule.trigger);
    if primary.is_some_and(|c| c.label.contains("stress")) {
        return format!(
            "Try a short breathing exercise or walk when {} comes up and watch whether the {} follows.",
            trigger, outcome
        );
    }

    match primary.map(|c| &c.event_type) {
        Some(EventType::Meal) => format!(
            "Try a smaller portion or swapping {} for a lighter option and see whether the {} eases.",
            trigger, outcome
        ),
        Some(EventType::Exercise) => format!(
            "Try adjusting when or how hard you do {} and see whether the {} changes.",
            trigger, outcome
        ),
        Some(EventType::Sleep) => format!(
            "Try keeping a steadier sleep routine and see whether the {} becomes less frequent.",
            outcome
        ),
        Some(EventType::ReminderCompletion) => format!(
            "Keep logging {} and mention the {} at your next check-in.",
            trigger, outcome
        ),
        Some(EventType::Mood) => format!(
            "Try noting what lies behind {} and whether a short break helps with the {}.",
            trigger, outcome
        ),
        _ => format!(
            "Try changing {} for a week and see whether the {} eases.",
            trigger, outcome
        ),
    }
}

fn primary_class(trigger: &TriggerSpec) -> Option<&ClassRef> {
    trigger.classes().into_iter().next()
}

fn percentage(rate: f64) -> i64 {
    if rate.is_finite() {
        (rate.clamp(0.0, 1.0) * 100.0).round() as i64
    } else {
        0
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

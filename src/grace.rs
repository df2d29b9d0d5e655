use std::collections::HashMap;
use std::time::Duration;

use globset::Glob;
use serde_yaml::Value;
use tracing::warn;

use crate::config::{Config, ConfigError};

/// Image label overriding any configured pattern for that image.
pub const GRACE_LABEL: &str = "com.caduc.image.grace_time";

/// An effective grace duration. `Never` (negative, `null` or `-1` in the
/// configuration) disables deletion entirely.
///
/// The derived ordering makes `Never` greater than any finite duration, so a
/// plain `max()` over candidates picks the most conservative one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GraceTime {
    After(Duration),
    Never,
}

/// Parse a grace text: human duration grammar first ("1d", "30s", "1h30m"),
/// bare integer seconds as fallback. Negative values mean never.
pub fn parse_grace(text: &str) -> Option<GraceTime> {
    let text = text.trim();
    if let Ok(duration) = humantime::parse_duration(text) {
        return Some(GraceTime::After(duration));
    }
    match text.parse::<i64>() {
        Ok(secs) if secs < 0 => Some(GraceTime::Never),
        Ok(secs) => Some(GraceTime::After(Duration::from_secs(secs as u64))),
        Err(_) => None,
    }
}

/// Interpret a configured `grace_time` value. `null` and `-1` (or any
/// negative) mean never; numbers are seconds; strings follow the duration
/// grammar.
fn from_value(value: &Value) -> Option<GraceTime> {
    match value {
        Value::Null => Some(GraceTime::Never),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if secs < 0.0 {
                return Some(GraceTime::Never);
            }
            Some(
                Duration::try_from_secs_f64(secs)
                    .map(GraceTime::After)
                    .unwrap_or(GraceTime::Never),
            )
        }
        Value::String(text) => parse_grace(text),
        _ => None,
    }
}

/// Gather the candidate grace times for an image: the label wins outright,
/// else every matching config pattern contributes, else the default.
pub fn candidates(
    config: &Config,
    labels: &HashMap<String, String>,
    tags: &[String],
    default_grace: &str,
) -> Vec<GraceTime> {
    if let Some(label) = labels.get(GRACE_LABEL).filter(|v| !v.is_empty()) {
        match parse_grace(label) {
            Some(grace) => return vec![grace],
            None => warn!("ignoring unparseable {GRACE_LABEL} label {label:?}"),
        }
    }

    let mut found = Vec::new();
    if let Some(section) = config.get("images").and_then(Value::as_mapping) {
        for (pattern, entry) in section {
            let Some(pattern) = pattern.as_str() else { continue };
            let Ok(glob) = Glob::new(pattern) else {
                // validated at startup; stay resilient if it slipped through
                warn!("skipping invalid image pattern {pattern:?}");
                continue;
            };
            let matcher = glob.compile_matcher();
            if !tags.iter().any(|tag| matcher.is_match(tag)) {
                continue;
            }
            let Some(value) = entry.as_mapping().and_then(|m| m.get("grace_time")) else {
                continue;
            };
            match from_value(value) {
                Some(grace) => found.push(grace),
                None => warn!("ignoring unparseable grace_time for pattern {pattern:?}"),
            }
        }
    }
    if !found.is_empty() {
        return found;
    }

    match parse_grace(default_grace) {
        Some(grace) => vec![grace],
        None => {
            warn!("unparseable default grace time {default_grace:?}, never deleting");
            vec![GraceTime::Never]
        }
    }
}

/// Most conservative candidate: `Never` dominates, otherwise the longest.
pub fn max_grace(candidates: &[GraceTime]) -> Option<GraceTime> {
    candidates.iter().copied().max()
}

/// Startup validation of the `images` section: every key must be a valid
/// glob pattern mapping to an entry with a usable `grace_time`.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let Some(section) = config.get("images") else {
        return Ok(());
    };
    let Some(section) = section.as_mapping() else {
        return Err(ConfigError::InvalidGraceTime {
            key: "images".into(),
            reason: "expected a map of glob patterns".into(),
        });
    };
    for (pattern, entry) in section {
        let pattern = pattern.as_str().ok_or_else(|| ConfigError::InvalidPattern {
            pattern: format!("{pattern:?}"),
            reason: "pattern keys must be strings".into(),
        })?;
        Glob::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let key = format!("images.{pattern}.grace_time");
        let value = entry
            .as_mapping()
            .and_then(|m| m.get("grace_time"))
            .ok_or_else(|| ConfigError::InvalidGraceTime {
                key: key.clone(),
                reason: "missing grace_time".into(),
            })?;
        from_value(value).ok_or_else(|| ConfigError::InvalidGraceTime {
            key,
            reason: format!("cannot interpret {value:?} as a duration"),
        })?;
    }
    Ok(())
}

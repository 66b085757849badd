// =============================================================================
// Shared types used across the liquidity engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// How an `as_of` timestamp is resolved against the bitemporal store.
///
/// - `Fetched`: what we had physically downloaded by `as_of` (`fetched_at`).
/// - `Pub`: what was published by `as_of` (vintage/publication timeline).
/// - `Obs`: observations up to `as_of` date, best-known vintage for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsOfMode {
    Fetched,
    Pub,
    Obs,
}

impl Default for AsOfMode {
    fn default() -> Self {
        Self::Fetched
    }
}

impl std::fmt::Display for AsOfMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetched => write!(f, "fetched"),
            Self::Pub => write!(f, "pub"),
            Self::Obs => write!(f, "obs"),
        }
    }
}

impl std::str::FromStr for AsOfMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fetched" => Ok(Self::Fetched),
            "pub" => Ok(Self::Pub),
            "obs" => Ok(Self::Obs),
            other => Err(format!("unknown as_of_mode: '{other}'")),
        }
    }
}

/// Parse a client-supplied `as_of` timestamp.
///
/// Accepts ISO 8601 with an offset or trailing `Z`, or a bare calendar date
/// (interpreted as UTC midnight). Returns `None` for anything else.
pub fn parse_as_of(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&chrono::Utc));
    }
    // Naive datetime without offset.
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Ternary indicator status plus the not-available marker.
///
/// Serialized as the wire strings `"+1"`, `"0"`, `"-1"`, `"n/a"` to match the
/// snapshot JSON contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorStatus {
    Supportive,
    Neutral,
    Draining,
    NotAvailable,
}

impl IndicatorStatus {
    /// Map a numeric contribution sign onto a status.
    pub fn from_sign(value: f64) -> Self {
        if value > 0.0 {
            Self::Supportive
        } else if value < 0.0 {
            Self::Draining
        } else {
            Self::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supportive => "+1",
            Self::Neutral => "0",
            Self::Draining => "-1",
            Self::NotAvailable => "n/a",
        }
    }

    /// Numeric contribution used by the bucket aggregator.
    pub fn contribution(&self) -> f64 {
        match self {
            Self::Supportive => 1.0,
            Self::Draining => -1.0,
            _ => 0.0,
        }
    }
}

impl Serialize for IndicatorStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for IndicatorStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "+1" => Ok(Self::Supportive),
            "0" => Ok(Self::Neutral),
            "-1" => Ok(Self::Draining),
            "n/a" => Ok(Self::NotAvailable),
            other => Err(serde::de::Error::custom(format!("unknown status: '{other}'"))),
        }
    }
}

impl std::fmt::Display for IndicatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which direction of movement supports liquidity for an indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directionality {
    HigherIsSupportive,
    LowerIsSupportive,
    HigherIsDraining,
}

impl Directionality {
    /// Sign multiplied into z-scores / threshold hits to derive status.
    pub fn sign(&self) -> f64 {
        match self {
            Self::HigherIsSupportive => 1.0,
            Self::LowerIsSupportive | Self::HigherIsDraining => -1.0,
        }
    }
}

/// Coarse scoring family exposed on the registry API surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scoring {
    Z,
    Threshold,
}

/// Continuous-score sign, distinct from the ±2-thresholded regime label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tilt {
    Positive,
    Negative,
    Flat,
}

impl Tilt {
    pub fn from_score(score_cont: f64) -> Self {
        if score_cont > 0.0 {
            Self::Positive
        } else if score_cont < 0.0 {
            Self::Negative
        } else {
            Self::Flat
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Flat => "flat",
        }
    }
}

/// Regime label applied at the ±2 integer-score thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegimeLabel {
    Positive,
    Neutral,
    Negative,
}

impl RegimeLabel {
    pub fn from_score(score: i64) -> Self {
        if score >= 2 {
            Self::Positive
        } else if score <= -2 {
            Self::Negative
        } else {
            Self::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "Positive",
            Self::Neutral => "Neutral",
            Self::Negative => "Negative",
        }
    }
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_strings_round_trip() {
        for (st, s) in [
            (IndicatorStatus::Supportive, "\"+1\""),
            (IndicatorStatus::Neutral, "\"0\""),
            (IndicatorStatus::Draining, "\"-1\""),
            (IndicatorStatus::NotAvailable, "\"n/a\""),
        ] {
            assert_eq!(serde_json::to_string(&st).unwrap(), s);
            let back: IndicatorStatus = serde_json::from_str(s).unwrap();
            assert_eq!(back, st);
        }
    }

    #[test]
    fn directionality_sign_mapping() {
        assert_eq!(Directionality::HigherIsSupportive.sign(), 1.0);
        assert_eq!(Directionality::LowerIsSupportive.sign(), -1.0);
        assert_eq!(Directionality::HigherIsDraining.sign(), -1.0);
    }

    #[test]
    fn tilt_and_label_thresholds() {
        assert_eq!(Tilt::from_score(0.3), Tilt::Positive);
        assert_eq!(Tilt::from_score(-0.3), Tilt::Negative);
        assert_eq!(Tilt::from_score(0.0), Tilt::Flat);

        assert_eq!(RegimeLabel::from_score(2), RegimeLabel::Positive);
        assert_eq!(RegimeLabel::from_score(1), RegimeLabel::Neutral);
        assert_eq!(RegimeLabel::from_score(-1), RegimeLabel::Neutral);
        assert_eq!(RegimeLabel::from_score(-2), RegimeLabel::Negative);
    }

    #[test]
    fn as_of_parsing_accepts_common_forms() {
        assert!(parse_as_of("2025-08-02T12:00:00Z").is_some());
        assert!(parse_as_of("2025-08-02T12:00:00+00:00").is_some());
        assert!(parse_as_of("2025-08-02T12:00:00").is_some());
        assert!(parse_as_of("2025-08-02").is_some());
        assert!(parse_as_of("noon yesterday").is_none());
        assert_eq!(
            parse_as_of("2025-08-02T12:00:00Z"),
            parse_as_of("2025-08-02T12:00:00+00:00")
        );
    }

    #[test]
    fn as_of_mode_parses() {
        assert_eq!("fetched".parse::<AsOfMode>().unwrap(), AsOfMode::Fetched);
        assert_eq!("PUB".parse::<AsOfMode>().unwrap(), AsOfMode::Pub);
        assert_eq!("obs".parse::<AsOfMode>().unwrap(), AsOfMode::Obs);
        assert!("later".parse::<AsOfMode>().is_err());
    }
}

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// PII risk classification written into the privacy envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PiiRisk {
    #[default]
    None,
    Low,
    Moderate,
    High,
}

impl PiiRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            PiiRisk::None => "none",
            PiiRisk::Low => "low",
            PiiRisk::Moderate => "moderate",
            PiiRisk::High => "high",
        }
    }
}

impl std::fmt::Display for PiiRisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

static HIGH_RISK: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"password\s*[=:]\s*\S+",
        r"secret\s*[=:]\s*\S+",
        r"api[_-]?key\s*[=:]\s*\S+",
        r"token\s*[=:]\s*\S+",
        r"authorization\s*[=:]\s*bearer",
        r"private[_-]?key",
        r"access[_-]?token",
        r"refresh[_-]?token",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

static MODERATE_RISK: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // Email; the TLD class is "letters >= 2" since matching is case-insensitive
        r"[\w.%+-]+@[\w.-]+\.[a-z]{2,}",
        // IPv4
        r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
        // Phone number
        r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b",
        // SSN reference
        r"ssn\s*[=:]\s*\d",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

static LOW_RISK: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"user[_-]?id\s*[=:]\s*\S+",
        r"account[_-]?id\s*[=:]\s*\S+",
        r"customer[_-]?id\s*[=:]\s*\S+",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){p}")).unwrap())
    .collect()
});

/// Classify the PII risk of log content. First matching tier wins, scanning
/// high to low.
pub fn classify_pii_risk(text: &str) -> PiiRisk {
    if text.is_empty() {
        return PiiRisk::None;
    }
    if HIGH_RISK.iter().any(|re| re.is_match(text)) {
        return PiiRisk::High;
    }
    if MODERATE_RISK.iter().any(|re| re.is_match(text)) {
        return PiiRisk::Moderate;
    }
    if LOW_RISK.iter().any(|re| re.is_match(text)) {
        return PiiRisk::Low;
    }
    PiiRisk::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_assignment_is_high() {
        assert_eq!(classify_pii_risk("password: hunter2"), PiiRisk::High);
        assert_eq!(classify_pii_risk("API_KEY=abc123"), PiiRisk::High);
        assert_eq!(classify_pii_risk("Authorization: Bearer xyz"), PiiRisk::High);
    }

    #[test]
    fn email_and_ip_are_moderate() {
        assert_eq!(classify_pii_risk("contact ops@example.com"), PiiRisk::Moderate);
        assert_eq!(classify_pii_risk("peer 10.0.0.1 disconnected"), PiiRisk::Moderate);
        assert_eq!(classify_pii_risk("call 612-555-1234"), PiiRisk::Moderate);
    }

    #[test]
    fn identifiers_are_low() {
        assert_eq!(classify_pii_risk("lookup user_id=42 ok"), PiiRisk::Low);
    }

    #[test]
    fn high_wins_over_moderate() {
        assert_eq!(
            classify_pii_risk("token=abc for ops@example.com"),
            PiiRisk::High
        );
    }

    #[test]
    fn clean_text_is_none() {
        assert_eq!(classify_pii_risk("request completed in 12ms"), PiiRisk::None);
        assert_eq!(classify_pii_risk(""), PiiRisk::None);
    }
}

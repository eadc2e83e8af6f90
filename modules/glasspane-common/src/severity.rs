use serde::{Deserialize, Serialize};

/// Log severity, ordered by the standard cloud-logging numeric levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[default]
    Default,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Severity {
    /// Numeric severity level. `is_error` and the cluster keys derive from this.
    pub fn level(&self) -> i32 {
        match self {
            Severity::Default => 0,
            Severity::Debug => 100,
            Severity::Info => 200,
            Severity::Notice => 300,
            Severity::Warning => 400,
            Severity::Error => 500,
            Severity::Critical => 600,
            Severity::Alert => 700,
            Severity::Emergency => 800,
        }
    }

    /// Parse a severity string. Unknown values map to `Default` rather than
    /// failing, since source tables carry free-form severity columns.
    pub fn parse(s: &str) -> Severity {
        match s.trim().to_uppercase().as_str() {
            "DEBUG" => Severity::Debug,
            "INFO" => Severity::Info,
            "NOTICE" => Severity::Notice,
            "WARNING" | "WARN" => Severity::Warning,
            "ERROR" => Severity::Error,
            "CRITICAL" => Severity::Critical,
            "ALERT" => Severity::Alert,
            "EMERGENCY" => Severity::Emergency,
            _ => Severity::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Default => "DEFAULT",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
            Severity::Alert => "ALERT",
            Severity::Emergency => "EMERGENCY",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_table_matches_severity() {
        assert_eq!(Severity::Default.level(), 0);
        assert_eq!(Severity::Info.level(), 200);
        assert_eq!(Severity::Error.level(), 500);
        assert_eq!(Severity::Emergency.level(), 800);
    }

    #[test]
    fn parse_is_lenient() {
        assert_eq!(Severity::parse("error"), Severity::Error);
        assert_eq!(Severity::parse("WARN"), Severity::Warning);
        assert_eq!(Severity::parse("nonsense"), Severity::Default);
    }

    #[test]
    fn ordering_follows_levels() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Debug < Severity::Info);
    }
}

//! Utility functions for volmand

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Parse duration string (e.g., "500ms", "30s", "5m", "1h")
pub fn parse_duration(s: &str) -> crate::Result<std::time::Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if s.ends_with("ms") {
        (&s[..s.len() - 2], "ms")
    } else {
        (&s[..s.len() - 1], &s[s.len() - 1..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => std::time::Duration::from_millis(num),
        "s" => std::time::Duration::from_secs(num),
        "m" => std::time::Duration::from_secs(num * 60),
        "h" => std::time::Duration::from_secs(num * 3600),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Validate a volume or snapshot name.
///
/// Names end up in brick paths, store keys, and worker process arguments, so
/// only a conservative identifier alphabet is accepted.
pub fn validate_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::ValidationFailed("name cannot be empty".into()));
    }

    if name.len() > 255 {
        return Err(crate::Error::ValidationFailed(
            "name too long (max 255 bytes)".into(),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::Error::ValidationFailed(format!(
            "invalid name '{}': only alphanumerics, '-' and '_' allowed",
            name
        )));
    }

    if !name.chars().next().unwrap().is_ascii_alphanumeric() {
        return Err(crate::Error::ValidationFailed(format!(
            "invalid name '{}': must start with an alphanumeric",
            name
        )));
    }

    Ok(())
}

/// Parse a "true"/"false"-ish option value (glusterd accepts several spellings)
pub fn parse_bool_option(value: &str) -> crate::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "yes" | "true" | "enable" | "1" => Ok(true),
        "off" | "no" | "false" | "disable" | "0" => Ok(false),
        other => Err(crate::Error::ValidationFailed(format!(
            "invalid boolean option value: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(
            parse_duration("500ms").unwrap(),
            std::time::Duration::from_millis(500)
        );
        assert_eq!(
            parse_duration("30s").unwrap(),
            std::time::Duration::from_secs(30)
        );
        assert_eq!(
            parse_duration("5m").unwrap(),
            std::time::Duration::from_secs(300)
        );
        assert_eq!(
            parse_duration("1h").unwrap(),
            std::time::Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("vol1").is_ok());
        assert!(validate_name("my-volume_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-leading-dash").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("has/slash").is_err());
        assert!(validate_name(&"x".repeat(300)).is_err());
    }

    #[test]
    fn test_parse_bool_option() {
        assert!(parse_bool_option("on").unwrap());
        assert!(parse_bool_option("TRUE").unwrap());
        assert!(!parse_bool_option("off").unwrap());
        assert!(!parse_bool_option("0").unwrap());
        assert!(parse_bool_option("maybe").is_err());
    }
}

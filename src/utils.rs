// Constants
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const SENSITIVE_HEADER_PARTS: &[&str] = &["authorization", "cookie", "token", "key", "secret"];

/// Mask header values that likely carry credentials, for logging.
pub fn redact_header_value(name: &str, value: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if SENSITIVE_HEADER_PARTS.iter().any(|part| lower.contains(part)) {
        match value.split_once(' ') {
            // Keep the scheme so "Bearer" vs "Basic" is still visible.
            Some((scheme, _)) if lower == "authorization" => format!("{} ***", scheme),
            _ => "***".to_string(),
        }
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_credentials() {
        assert_eq!(redact_header_value("Authorization", "Bearer abc"), "Bearer ***");
        assert_eq!(redact_header_value("X-Api-Key", "abc"), "***");
        assert_eq!(redact_header_value("Cookie", "a=b"), "***");
        assert_eq!(redact_header_value("X-Auth-Token", "t"), "***");
        assert_eq!(redact_header_value("Accept", "text/event-stream"), "text/event-stream");
    }
}

use url::Url;

/// Returned for values that do not parse as a URL.
pub const INVALID_URL: &str = "[invalid URL]";

/// Appended to URLs that had credentials stripped.
pub const REDACTION_SUFFIX: &str = " (credentials redacted)";

/// Strips embedded username and password from a connection URL so it can be
/// logged. Inputs without credentials come back unchanged.
pub fn redact(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let Ok(mut url) = Url::parse(raw) else {
        return INVALID_URL.to_string();
    };

    if url.username().is_empty() && url.password().is_none() {
        return raw.to_string();
    }

    if url.set_username("").is_err() || url.set_password(None).is_err() {
        return INVALID_URL.to_string();
    }

    format!("{url}{REDACTION_SUFFIX}")
}

//! Opaque connection string.
//!
//! The value is passed to the driver untouched. Lookups and redaction
//! understand the usual `Key=Value;Key=Value;` layout but never reject a
//! string that does not follow it.

use std::fmt;

/// Keys whose values are masked by [`ConnectionString::redacted`].
const SECRET_KEYS: &[&str] = &["password", "pwd"];

/// A connection string shared by every session a pool creates.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString(String);

impl ConnectionString {
    /// Wrap a connection string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw value, as handed to the driver.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Look up the value of a key, ignoring case and surrounding whitespace.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        pairs(&self.0)
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Render the string with secrets masked, for logs.
    #[must_use]
    pub fn redacted(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for part in self.0.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((key, _)) if is_secret(key.trim()) => {
                    out.push_str(key.trim());
                    out.push_str("=***");
                }
                _ => out.push_str(part),
            }
            out.push(';');
        }
        out
    }
}

fn pairs(value: &str) -> impl Iterator<Item = (&str, &str)> {
    value
        .split(';')
        .filter_map(|part| part.split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
}

fn is_secret(key: &str) -> bool {
    SECRET_KEYS.iter().any(|s| key.eq_ignore_ascii_case(s))
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionString")
            .field(&self.redacted())
            .finish()
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl From<&str> for ConnectionString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConnectionString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let cs = ConnectionString::new("Server=db1; Database=game ;Uid=app;Pwd=hunter2;");
        assert_eq!(cs.get("server"), Some("db1"));
        assert_eq!(cs.get("DATABASE"), Some("game"));
        assert_eq!(cs.get("port"), None);
    }

    #[test]
    fn test_redaction_masks_secrets() {
        let cs = ConnectionString::new("Server=db1;Password=hunter2;pwd=x;Uid=app");
        let redacted = cs.redacted();
        assert_eq!(redacted, "Server=db1;Password=***;pwd=***;Uid=app;");
        assert!(!format!("{cs:?}").contains("hunter2"));
        assert!(!cs.to_string().contains("hunter2"));
    }

    #[test]
    fn test_raw_value_is_untouched() {
        let raw = "not a key value string";
        let cs = ConnectionString::from(raw);
        assert_eq!(cs.as_str(), raw);
        assert_eq!(cs.redacted(), "not a key value string;");
    }
}

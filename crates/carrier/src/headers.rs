//! HTTP header collection.
//!
//! Headers preserve insertion order and the original casing of names, allow
//! duplicate names, and compare names case-insensitively. Transports receive
//! the names exactly as the caller wrote them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known header names.
pub mod name {
    pub const ACCEPT: &str = "Accept";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const CONTENT_DISPOSITION: &str = "Content-Disposition";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const X_REQUEST_ID: &str = "X-Request-ID";
}

/// An ordered multimap of HTTP headers.
///
/// Lookup is case-insensitive while iteration yields names with their
/// original casing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a header, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace all values for `name` with a single value. Appends if absent.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let mut replaced = false;
        self.0.retain_mut(|(n, v)| {
            if n.eq_ignore_ascii_case(&name) {
                if replaced {
                    return false;
                }
                *v = value.clone();
                replaced = true;
            }
            true
        });
        if !replaced {
            self.0.push((name, value));
        }
    }

    /// The first value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every value for `name`.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl PartialEq for Headers {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|((an, av), (bn, bv))| an.eq_ignore_ascii_case(bn) && av == bv)
    }
}

impl Eq for Headers {}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

impl<N: Into<String>, V: Into<String>, const LEN: usize> From<[(N, V); LEN]> for Headers {
    fn from(pairs: [(N, V); LEN]) -> Self {
        pairs.into_iter().collect()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{name}: {value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "application/json");

        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(headers.get("Content-Length"), None);
    }

    #[test]
    fn original_casing_is_preserved() {
        let mut headers = Headers::new();
        headers.append("x-CuStOm", "1");

        let collected: Vec<_> = headers.iter().collect();
        assert_eq!(collected, vec![("x-CuStOm", "1")]);
    }

    #[test]
    fn append_keeps_duplicates_in_order() {
        let mut headers = Headers::new();
        headers.append("Accept", "text/html");
        headers.append("accept", "application/json");

        assert_eq!(headers.get("Accept"), Some("text/html"));
        let all: Vec<_> = headers.get_all("ACCEPT").collect();
        assert_eq!(all, vec!["text/html", "application/json"]);
    }

    #[test]
    fn set_replaces_every_duplicate() {
        let mut headers = Headers::new();
        headers.append("Accept", "text/html");
        headers.append("accept", "application/json");
        headers.set("Accept", "image/png");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("accept"), Some("image/png"));
    }

    #[test]
    fn equality_ignores_name_casing() {
        let a: Headers = [("Content-Type", "text/plain")].into();
        let b: Headers = [("content-type", "text/plain")].into();
        assert_eq!(a, b);
    }
}

//! Response header data model.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::headers::{self, Headers};

static FILENAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"filename="([^"]+)""#).expect("literal pattern"));

/// The metadata of an HTTP response: status code, final URL, and headers.
///
/// This is the lowest common denominator of a response header across
/// transport backends. Everything beyond the three stored fields is derived
/// on demand and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// The HTTP status code, such as `200` or `404`.
    pub status: u16,
    /// The final URL after any redirects, when the backend reports one.
    pub url: Option<String>,
    /// The response headers.
    pub headers: Headers,
}

impl ResponseHeader {
    pub fn new(status: u16, url: Option<String>, headers: Headers) -> Self {
        Self {
            status,
            url,
            headers,
        }
    }

    /// A header with the given status and no headers, standing in for a real
    /// response when a retry handler substitutes a default value.
    pub fn synthesized(status: u16, url: Option<String>) -> Self {
        Self::new(status, url, Headers::new())
    }

    /// The expected body length from the `Content-Length` header, if present
    /// and parseable.
    pub fn expected_content_length(&self) -> Option<u64> {
        self.headers
            .get(headers::name::CONTENT_LENGTH)
            .and_then(|value| value.trim().parse().ok())
    }

    /// A filename suggested by the `Content-Disposition` header, if any.
    pub fn suggested_filename(&self) -> Option<String> {
        let disposition = self.headers.get(headers::name::CONTENT_DISPOSITION)?;
        FILENAME_PATTERN
            .captures(disposition)
            .map(|captures| captures[1].to_string())
    }

    /// The MIME type from the `Content-Type` header, without parameters.
    pub fn mime_type(&self) -> Option<&str> {
        self.headers
            .get(headers::name::CONTENT_TYPE)
            .map(|value| value.split(';').next().unwrap_or(value).trim())
    }
}

impl fmt::Display for ResponseHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Response:")?;
        writeln!(f, "\tStatus - {}", self.status)?;
        if let Some(url) = &self.url {
            writeln!(f, "\tURL - {url}")?;
        }
        if let Some(length) = self.expected_content_length() {
            writeln!(f, "\tExpected length - {length}")?;
        }
        if let Some(mime) = self.mime_type() {
            writeln!(f, "\tMIME type - {mime}")?;
        }
        if let Some(filename) = self.suggested_filename() {
            writeln!(f, "\tSuggested filename - {filename}")?;
        }
        write!(f, "\tHeaders ({})", self.headers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_parses_when_present() {
        let header = ResponseHeader::new(
            200,
            None,
            [(headers::name::CONTENT_LENGTH, "1024")].into(),
        );
        assert_eq!(header.expected_content_length(), Some(1024));

        let absent = ResponseHeader::synthesized(200, None);
        assert_eq!(absent.expected_content_length(), None);

        let garbage = ResponseHeader::new(
            200,
            None,
            [(headers::name::CONTENT_LENGTH, "not-a-number")].into(),
        );
        assert_eq!(garbage.expected_content_length(), None);
    }

    #[test]
    fn suggested_filename_comes_from_disposition() {
        let header = ResponseHeader::new(
            200,
            None,
            [(
                headers::name::CONTENT_DISPOSITION,
                r#"attachment; filename="report.pdf""#,
            )]
            .into(),
        );
        assert_eq!(header.suggested_filename(), Some("report.pdf".to_string()));

        let malformed = ResponseHeader::new(
            200,
            None,
            [(headers::name::CONTENT_DISPOSITION, "attachment")].into(),
        );
        assert_eq!(malformed.suggested_filename(), None);
    }

    #[test]
    fn mime_type_strips_parameters() {
        let header = ResponseHeader::new(
            200,
            None,
            [(headers::name::CONTENT_TYPE, "application/json; charset=utf-8")].into(),
        );
        assert_eq!(header.mime_type(), Some("application/json"));
    }

    #[test]
    fn serde_round_trip() {
        let header = ResponseHeader::new(
            201,
            Some("https://example.com/thing".to_string()),
            [("Content-Type", "text/plain")].into(),
        );
        let json = serde_json::to_string(&header).unwrap();
        let back: ResponseHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(header, back);
    }
}

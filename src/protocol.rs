//! Request payload extraction and the canned response.
//!
//! Requests are expected to look like HTTP: a header section and a body
//! separated by a blank line (`\r\n\r\n`). Nothing about the headers is
//! interpreted. The body following the last blank line is decoded as a
//! JSON object (or `null`).

use serde_json::{Map, Value};

/// The only response the server ever sends.
pub const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n";

/// Header/body separator.
const BOUNDARY: &str = "\r\n\r\n";

/// A decoded request payload.
pub type Payload = Map<String, Value>;

/// Reasons no payload could be extracted from a request.
#[derive(Debug)]
pub enum ExtractError {
    /// The request has no blank line separating headers from a body.
    MissingBoundary,
    /// The body is not a JSON object.
    InvalidJson(serde_json::Error),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::MissingBoundary => write!(f, "no header/body boundary in request"),
            ExtractError::InvalidJson(e) => write!(f, "error parsing JSON: {e}"),
        }
    }
}

impl std::error::Error for ExtractError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExtractError::MissingBoundary => None,
            ExtractError::InvalidJson(e) => Some(e),
        }
    }
}

/// Extract the JSON object carried in the body of `request`.
///
/// A `null` body yields an empty payload.
pub fn extract_payload(request: &str) -> Result<Payload, ExtractError> {
    let body = body(request).ok_or(ExtractError::MissingBoundary)?;
    let body = strip_nul(body);
    let payload: Option<Payload> =
        serde_json::from_str(&body).map_err(ExtractError::InvalidJson)?;
    Ok(payload.unwrap_or_default())
}

/// Everything after the last boundary, or `None` if there is no boundary.
pub fn body(request: &str) -> Option<&str> {
    request
        .rfind(BOUNDARY)
        .map(|pos| &request[pos + BOUNDARY.len()..])
}

/// Remove NUL characters, which are never valid inside JSON text.
pub fn strip_nul(text: &str) -> String {
    text.chars().filter(|&c| c != '\0').collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_post_body() {
        let request = "POST / HTTP/1.1\r\nHost: x\r\n\r\n{\"a\":1,\"b\":\"x\"}";
        let payload = extract_payload(request).unwrap();
        assert_eq!(Value::Object(payload), json!({"a": 1, "b": "x"}));
    }

    #[test]
    fn test_empty_body() {
        match extract_payload("GET / HTTP/1.1\r\nHost: x\r\n\r\n") {
            Err(ExtractError::InvalidJson(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_missing_boundary() {
        match extract_payload("justsometext") {
            Err(ExtractError::MissingBoundary) => {}
            other => panic!("unexpected: {:?}", other),
        }

        // A single CRLF is not a boundary
        match extract_payload("GET / HTTP/1.1\r\n{\"a\":1}") {
            Err(ExtractError::MissingBoundary) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_last_boundary_wins() {
        let request = "POST / HTTP/1.1\r\n\r\n{\"first\":true}\r\n\r\n{\"second\":true}";
        let payload = extract_payload(request).unwrap();
        assert_eq!(Value::Object(payload), json!({"second": true}));
    }

    #[test]
    fn test_nul_padding_stripped() {
        let mut request = String::from("POST / HTTP/1.1\r\n\r\n{\"n\":[1,2,null]}");
        request.push_str(&"\0".repeat(64));
        let payload = extract_payload(&request).unwrap();
        assert_eq!(Value::Object(payload), json!({"n": [1, 2, null]}));
    }

    #[test]
    fn test_matches_direct_decode() {
        let bodies = [
            r#"{}"#,
            r#"{"nested":{"deep":[true,false,{"x":1.5}]}}"#,
            "{\"k\":\0\"v\"}",
            r#" { "spaced" : "out" } "#,
        ];
        for b in bodies {
            let request = format!("PUT /thing HTTP/1.1\r\nA: b\r\n\r\n{b}");
            let direct: Payload = serde_json::from_str(&strip_nul(b)).unwrap();
            assert_eq!(extract_payload(&request).unwrap(), direct, "body {b:?}");
        }
    }

    #[test]
    fn test_invalid_json() {
        for b in ["{\"a\":", "not json", "{'a':1}", "[1,2,3]", "42", "\"str\""] {
            let request = format!("POST / HTTP/1.1\r\n\r\n{b}");
            assert!(
                matches!(extract_payload(&request), Err(ExtractError::InvalidJson(_))),
                "body {b:?}"
            );
        }
    }

    #[test]
    fn test_null_body() {
        let payload = extract_payload("POST / HTTP/1.1\r\n\r\nnull").unwrap();
        assert!(payload.is_empty());

        let payload = extract_payload("POST / HTTP/1.1\r\n\r\n null\0\0").unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_body() {
        assert_eq!(body("h\r\n\r\nb"), Some("b"));
        assert_eq!(body("h\r\n\r\n"), Some(""));
        assert_eq!(body("h\r\nb"), None);
    }

    #[test]
    fn test_strip_nul() {
        assert_eq!(strip_nul("\0a\0b\0"), "ab");
        assert_eq!(strip_nul("plain"), "plain");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ExtractError::MissingBoundary.to_string(),
            "no header/body boundary in request"
        );
        let err = extract_payload("x\r\n\r\n{").unwrap_err();
        assert!(err.to_string().starts_with("error parsing JSON"));
    }
}

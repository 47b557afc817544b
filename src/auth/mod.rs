use axum::http::HeaderMap;


/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
/// Returns the token string if present and valid.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Parse bearer token from Authorization header value
fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(TokenError::InvalidFormat);
    }

    if parts[0].to_lowercase() != "bearer" {
        return Err(TokenError::InvalidFormat);
    }

    let token = parts[1].trim();

    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header not present
    Missing,
    /// Invalid format (not "Bearer <token>")
    InvalidFormat,
    /// Token is empty string
    Empty,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "Authorization header not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid authorization header format"),
            TokenError::Empty => write!(f, "Authorization token is empty"),
        }
    }
}

impl std::error::Error for TokenError {}

/// Access gate for privileged operations.
///
/// One trusted automation caller holds the configured shared key; every
/// privileged route (get-by-id, list-all, refresh) passes through
/// [`authorize`](ApiKeyGate::authorize). Fails closed: no header, wrong
/// scheme, no server-side key, or a mismatched value are all rejections.
#[derive(Clone)]
pub struct ApiKeyGate {
    key: Option<String>,
}

impl ApiKeyGate {
    /// `key: None` means no caller can ever pass the gate.
    pub fn new(key: Option<String>) -> Self {
        Self { key }
    }

    /// Checks the presented bearer credential against the configured key.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<(), GateError> {
        let presented = extract_bearer_token(headers).map_err(GateError::InvalidHeader)?;

        let Some(expected) = &self.key else {
            return Err(GateError::NotConfigured);
        };

        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            return Err(GateError::Mismatch);
        }

        Ok(())
    }
}

/// Byte comparison that does not short-circuit on the first mismatch,
/// so response timing does not leak the matching prefix length.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Gate rejection reasons. All map to 401 at the API boundary.
#[derive(Debug, PartialEq, Clone)]
pub enum GateError {
    /// Missing/malformed Authorization header
    InvalidHeader(TokenError),
    /// No shared key configured server-side
    NotConfigured,
    /// Presented key does not match
    Mismatch,
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::InvalidHeader(e) => write!(f, "{}", e),
            GateError::NotConfigured => write!(f, "No API key configured"),
            GateError::Mismatch => write!(f, "Invalid API key"),
        }
    }
}

impl std::error::Error for GateError {}

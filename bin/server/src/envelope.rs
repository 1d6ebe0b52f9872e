//! JSON envelope shared by every non-streaming response.

use serde::{Deserialize, Serialize};

/// `{"success": .., "data": .., "errors": [..]}`
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub errors: Vec<ErrorDetail>,
}

/// One entry of [`Envelope::errors`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code, e.g. `NOT_FOUND`.
    pub code: String,
    pub message: String,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            errors: vec![ErrorDetail {
                code: code.into(),
                message: message.into(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_envelope_has_null_data() {
        let envelope: Envelope<()> = Envelope::error("NOT_FOUND", "conversation not found");

        assert_eq!(
            serde_json::to_value(&envelope).expect("serialize"),
            json!({
                "success": false,
                "data": null,
                "errors": [{"code": "NOT_FOUND", "message": "conversation not found"}]
            })
        );
    }
}

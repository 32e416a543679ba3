use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The error object every failed invocation surfaces, locally and on the
/// wire. `code` doubles as the HTTP status of the reply; `cause` chains
/// without loss and serializes to a stable JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeError {
    pub code: u16,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<CodeError>>,
}

impl CodeError {
    pub fn new(code: u16, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            name: name.into(),
            message: message.into(),
            meta: BTreeMap::new(),
            cause: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "bad_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, "forbidden", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, "not_found", message)
    }

    pub fn not_acceptable(message: impl Into<String>) -> Self {
        Self::new(406, "not_acceptable", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(408, "timeout", message)
    }

    pub fn locked(message: impl Into<String>) -> Self {
        Self::new(423, "locked", message)
    }

    pub fn too_early(message: impl Into<String>) -> Self {
        Self::new(425, "too_early", message)
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(429, "too_many_requests", message)
    }

    pub fn overloaded(message: impl Into<String>) -> Self {
        Self::new(503, "overloaded", message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(503, "unavailable", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(555, "internal", message)
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Chain `cause` under this error. An existing cause is pushed one
    /// level down, so nothing is lost.
    pub fn with_cause(mut self, cause: CodeError) -> Self {
        match self.cause.take() {
            None => self.cause = Some(Box::new(cause)),
            Some(prior) => self.cause = Some(Box::new(cause.with_cause(*prior))),
        }
        self
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    /// The deepest cause in the chain, or the error itself.
    pub fn root(&self) -> &CodeError {
        let mut cur = self;
        while let Some(cause) = &cur.cause {
            cur = cause;
        }
        cur
    }
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<serde_json::Error> for CodeError {
    fn from(err: serde_json::Error) -> Self {
        CodeError::internal(format!("json codec failed: {err}"))
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_cause_chain() {
        let err = CodeError::internal("handler failed")
            .with_cause(CodeError::unavailable("peer gone"))
            .with_cause(CodeError::timeout("dial timed out"));

        assert_eq!(err.root().name, "unavailable");
        assert_eq!(
            err.to_string(),
            "internal: handler failed: timeout: dial timed out: unavailable: peer gone"
        );
    }

    #[test]
    fn test_json_shape_is_stable() {
        let err = CodeError::not_found("service 'users' not found")
            .with_meta("service", "users")
            .with_cause(CodeError::internal("registry miss"));
        let encoded = serde_json::to_value(&err).unwrap();

        assert_eq!(
            encoded,
            serde_json::json!({
                "code": 404,
                "name": "not_found",
                "message": "service 'users' not found",
                "meta": { "service": "users" },
                "cause": {
                    "code": 555,
                    "name": "internal",
                    "message": "registry miss",
                },
            })
        );

        let decoded: CodeError = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, err);
    }
}

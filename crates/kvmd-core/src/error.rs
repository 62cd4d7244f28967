use thiserror::Error;

/// Error kinds every component converges to at the HTTP edge.
///
/// The wire envelope is `{"error": <name>, "error_msg": <message>}` with
/// the status code derived from the kind: Busy → 409, Validator and
/// Operation → 400, Unauthorized → 401, Forbidden → 403, Unavailable →
/// 503, Internal → 500.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validator(String),
    #[error("{0}")]
    Operation(String),
    #[error("{0}")]
    Busy(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            Self::Validator(_) | Self::Operation(_) => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::Busy(_) => 409,
            Self::Unavailable(_) => 503,
            Self::Internal(_) => 500,
        }
    }

    /// The `error` field of the JSON envelope.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validator(_) => "Validator",
            Self::Operation(_) => "Operation",
            Self::Busy(_) => "IsBusy",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::Unavailable(_) => "Unavailable",
            Self::Internal(_) => "Internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_contract() {
        assert_eq!(ApiError::Validator("x".into()).status(), 400);
        assert_eq!(ApiError::Operation("x".into()).status(), 400);
        assert_eq!(ApiError::Busy("x".into()).status(), 409);
        assert_eq!(ApiError::Unauthorized.status(), 401);
        assert_eq!(ApiError::Forbidden.status(), 403);
        assert_eq!(ApiError::Unavailable("x".into()).status(), 503);
        assert_eq!(ApiError::Internal("x".into()).status(), 500);
    }
}

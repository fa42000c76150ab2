/// Error kind: every error the kernel raises
/// is classified into one of these so a step can decide whether to retry, fail
/// the fiber, or surface a condition on the Domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 409 / 429 / 5xx from the Kubernetes API. Retried with backoff by the
    /// step that raised it; promoted to `Internal` once attempts are exhausted.
    Transient,
    /// 404 encountered where the caller can transition to a create path.
    NotFound,
    /// A suspend's fallback delay fired before the awaited event arrived.
    WatchTimeout,
    /// The fiber was pre-empted by a newer submission for the same key.
    Cancelled,
    /// The domain snapshot itself is invalid (e.g. replicas > cluster capacity).
    Validation,
    /// A programming defect or anything else that must not be retried blindly.
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    #[error("invalid domain snapshot: {0}")]
    Validation(String),

    #[error("fiber cancelled")]
    Cancelled,

    #[error("timed out waiting for {0}")]
    TimeoutExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kube { source } => classify_kube_error(source),
            Error::Cancelled => ErrorKind::Cancelled,
            Error::TimeoutExceeded(_) => ErrorKind::WatchTimeout,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Json { .. } | Error::ParseDuration { .. } | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }
}

fn classify_kube_error(source: &kube::Error) -> ErrorKind {
    match source {
        kube::Error::Api(ae) if ae.code == 404 => ErrorKind::NotFound,
        kube::Error::Api(ae) if ae.code == 409 || ae.code == 429 || ae.code >= 500 => {
            ErrorKind::Transient
        }
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "boom".to_string(),
                code,
            }),
        }
    }

    #[test]
    fn conflict_is_transient_and_retryable() {
        let e = api_error(409);
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(e.is_retryable());
    }

    #[test]
    fn not_found_is_not_retryable() {
        let e = api_error(404);
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert!(e.is_not_found());
        assert!(!e.is_retryable());
    }

    #[test]
    fn server_error_is_transient() {
        assert_eq!(api_error(503).kind(), ErrorKind::Transient);
    }

    #[test]
    fn validation_error_never_retries() {
        let e = Error::Validation("replicas exceed capacity".to_string());
        assert_eq!(e.kind(), ErrorKind::Validation);
        assert!(!e.is_retryable());
    }
}

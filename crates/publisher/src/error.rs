/// Failures a publishing session can report.
///
/// Setup and unexpected connection failures land on the session's error
/// observable; the others are logged where they happen and absorbed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("capture device not found: {0}")]
    DeviceNotFound(String),
    #[error("could not create device input: {0}")]
    DeviceInputCreationFailed(String),
    #[error("session setup failed: {0}")]
    SessionSetupFailed(String),
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("could not apply remote candidate: {0}")]
    CandidateApplyFailed(String),
    #[error("signaling transport failed: {0}")]
    TransportFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DeviceNotFound,
    DeviceInputCreationFailed,
    SessionSetupFailed,
    NegotiationFailed,
    ConnectionFailed,
    CandidateApplyFailed,
    TransportFailed,
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            Self::DeviceInputCreationFailed(_) => ErrorKind::DeviceInputCreationFailed,
            Self::SessionSetupFailed(_) => ErrorKind::SessionSetupFailed,
            Self::NegotiationFailed(_) => ErrorKind::NegotiationFailed,
            Self::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Self::CandidateApplyFailed(_) => ErrorKind::CandidateApplyFailed,
            Self::TransportFailed(_) => ErrorKind::TransportFailed,
        }
    }

    /// Session setup failure from an engine error, keeping its context chain.
    pub(crate) fn setup(err: &anyhow::Error) -> Self {
        Self::SessionSetupFailed(format!("{err:#}"))
    }

    pub(crate) fn negotiation(err: &anyhow::Error) -> Self {
        Self::NegotiationFailed(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            PublishError::ConnectionFailed("ice".into()).kind(),
            ErrorKind::ConnectionFailed
        );
        assert_eq!(
            PublishError::DeviceNotFound("front".into()).kind(),
            ErrorKind::DeviceNotFound
        );
    }

    #[test]
    fn engine_errors_keep_context() {
        let err = anyhow::anyhow!("dtls exploded").context("Failed to set local description");
        let mapped = PublishError::negotiation(&err);
        assert_eq!(mapped.kind(), ErrorKind::NegotiationFailed);
        assert_eq!(
            mapped.to_string(),
            "negotiation failed: Failed to set local description: dtls exploded"
        );
    }
}

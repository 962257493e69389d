use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to an external model service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no API key configured (set OPENAI_API_KEY)")]
    MissingApiKey,

    #[error("request to {endpoint} timed out")]
    Timeout {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {endpoint} failed")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned HTTP {code}: {body}")]
    Status {
        endpoint: String,
        code: u16,
        body: String,
    },

    #[error("{endpoint} returned an unusable response: {reason}")]
    MalformedResponse { endpoint: String, reason: String },
}

impl ServiceError {
    pub fn from_reqwest(endpoint: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout {
                endpoint: endpoint.to_string(),
                source,
            };
        }
        Self::Transport {
            endpoint: endpoint.to_string(),
            source,
        }
    }

    pub fn malformed(endpoint: &str, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Failure of one image-reproduction evaluation.
///
/// An unparseable judgment is not an error; it scores 0.0.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("failed reading reference image {}", path.display())]
    ReadImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image generation call failed")]
    Generation(#[source] ServiceError),

    #[error("similarity scoring call failed")]
    Scoring(#[source] ServiceError),
}

impl MetricError {
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Generation(err) | Self::Scoring(err) => Some(err),
            Self::ReadImage { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.service_error()
            .map(ServiceError::is_timeout)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::{MetricError, ServiceError};

    #[test]
    fn metric_error_names_the_failing_call() {
        let generation = MetricError::Generation(ServiceError::Status {
            endpoint: "https://api.openai.com/v1/images/generations".to_string(),
            code: 500,
            body: "upstream".to_string(),
        });
        assert_eq!(generation.to_string(), "image generation call failed");
        let cause = generation.source().map(|err| err.to_string());
        assert_eq!(
            cause.as_deref(),
            Some("https://api.openai.com/v1/images/generations returned HTTP 500: upstream")
        );

        let scoring = MetricError::Scoring(ServiceError::MissingApiKey);
        assert_eq!(scoring.to_string(), "similarity scoring call failed");
        assert!(!scoring.is_timeout());
    }

    #[test]
    fn read_errors_carry_the_path() {
        let err = MetricError::ReadImage {
            path: "data/images/cat.png".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(err.to_string(), "failed reading reference image data/images/cat.png");
        assert!(err.service_error().is_none());
    }

    #[test]
    fn anyhow_chain_shows_service_detail() {
        let err = anyhow::Error::new(MetricError::Scoring(ServiceError::malformed(
            "chat/completions",
            "missing choices",
        )));
        assert_eq!(
            format!("{err:#}"),
            "similarity scoring call failed: chat/completions returned an unusable response: missing choices"
        );
    }
}

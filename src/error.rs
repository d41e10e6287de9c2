use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum DashboardError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API returned {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("Session expired, login required")]
    LoginRequired,

    #[error("Telemetry store error: {0}")]
    Telemetry(String),

    #[error("Telemetry write rejected for {path}: {reason}")]
    WriteRejected { path: String, reason: String },

    #[error("Failed to subscribe to {path}: {reason}")]
    SubscribeFailed { path: String, reason: String },

    #[error("Fridge {0} is unavailable")]
    DeviceUnavailable(String),

    #[error("Fridge card {0} is not mounted")]
    NotMounted(String),

    #[error("Product {0} not found")]
    UnknownProduct(i64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

impl DashboardError {
    /// Whether the failure may clear up on the next natural trigger
    /// (poll tick, roster refresh, user retry).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DashboardError::Http(_) | DashboardError::Timeout(_) | DashboardError::Telemetry(_)
        ) || matches!(self, DashboardError::Api { status, .. } if *status >= 500)
    }
}

impl From<reqwest::Error> for DashboardError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DashboardError::Timeout(e.to_string())
        } else {
            DashboardError::Http(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, DashboardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DashboardError::Timeout("roster".into()).is_transient());
        assert!(DashboardError::Telemetry("offline".into()).is_transient());
        assert!(
            DashboardError::Api {
                status: 502,
                detail: "bad gateway".into()
            }
            .is_transient()
        );
        assert!(
            !DashboardError::Api {
                status: 404,
                detail: "not found".into()
            }
            .is_transient()
        );
        assert!(!DashboardError::LoginRequired.is_transient());
    }
}

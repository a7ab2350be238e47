//! Per-client admission control.

pub mod bucket;
pub mod controller;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bucket::TokenBucket;
pub use controller::AdmissionController;

/// Rate-limiting settings for one client, or the process-wide default
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserLimits {
    /// Requests per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u32,
}

impl UserLimits {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self { rate, burst }
    }

    pub fn validate(&self) -> Result<(), LimitsError> {
        if self.rate > 0.0 && self.rate.is_finite() && self.burst > 0 {
            Ok(())
        } else {
            Err(LimitsError::Invalid {
                rate: self.rate,
                burst: self.burst,
            })
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LimitsError {
    #[error("rate and burst must be positive (rate={rate}, burst={burst})")]
    Invalid { rate: f64, burst: u32 },

    #[error("limits already exist for client {0}")]
    AlreadyExists(String),

    #[error("no limits set for client {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_non_positive() {
        assert!(UserLimits::new(1.5, 1).validate().is_ok());
        assert!(matches!(UserLimits::new(0.0, 1).validate(), Err(LimitsError::Invalid { .. })));
        assert!(matches!(UserLimits::new(-3.0, 1).validate(), Err(LimitsError::Invalid { .. })));
        assert!(matches!(UserLimits::new(2.0, 0).validate(), Err(LimitsError::Invalid { .. })));
        assert!(UserLimits::new(f64::NAN, 1).validate().is_err());
    }

    #[test]
    fn test_limits_json_shape() {
        let limits: UserLimits = serde_json::from_str(r#"{"rate": 2.5, "burst": 4}"#).unwrap();
        assert_eq!(limits, UserLimits::new(2.5, 4));
        assert!(serde_json::from_str::<UserLimits>(r#"{"rate": 2.5, "burst": -1}"#).is_err());
    }
}

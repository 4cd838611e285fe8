use std::time::Duration;

use crate::http::error::HttpError;
use crate::http::timeout::MinDataRate;

/// Per-connection protocol limits.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Longest request line, CRLF included.
    pub max_request_line_size: usize,
    /// Budget for the header block, terminating blank line included.
    pub max_request_headers_total_size: usize,
    pub max_request_header_count: usize,
    /// `None` means unlimited.
    pub max_request_body_size: Option<u64>,
    pub min_request_body_data_rate: Option<MinDataRate>,
    pub min_response_data_rate: Option<MinDataRate>,
    pub keep_alive_timeout: Duration,
    pub request_headers_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        let rate = MinDataRate::new(240.0, Duration::from_secs(5)).ok();
        Self {
            max_request_line_size: 8 * 1024,
            max_request_headers_total_size: 32 * 1024,
            max_request_header_count: 100,
            max_request_body_size: Some(30_000_000),
            min_request_body_data_rate: rate,
            min_response_data_rate: rate,
            keep_alive_timeout: Duration::from_secs(130),
            request_headers_timeout: Duration::from_secs(30),
        }
    }
}

impl Limits {
    pub fn validate(&self) -> Result<(), HttpError> {
        let sizes = [
            ("max_request_line_size", self.max_request_line_size),
            ("max_request_headers_total_size", self.max_request_headers_total_size),
            ("max_request_header_count", self.max_request_header_count),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(HttpError::invalid_argument(format!("{} must be positive", name)));
            }
        }
        if self.keep_alive_timeout.is_zero() || self.request_headers_timeout.is_zero() {
            return Err(HttpError::invalid_argument("timeouts must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let limits = Limits::default();
        assert!(limits.validate().is_ok());
        assert_eq!(limits.max_request_line_size, 8192);
        assert!(limits.min_request_body_data_rate.is_some());
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let limits = Limits {
            max_request_header_count: 0,
            ..Limits::default()
        };
        assert!(matches!(limits.validate(), Err(HttpError::InvalidArgument(_))));
    }
}

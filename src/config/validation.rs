use std::net::SocketAddr;

use axum::http::HeaderName;
use eyre::Result;

use crate::config::models::ProxyConfig;

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Proxy configuration validator
pub struct ProxyConfigValidator;

impl ProxyConfigValidator {
    /// Validate the entire proxy configuration, reporting every problem at once.
    pub fn validate(config: &ProxyConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        match Self::validate_url(&config.public_url, "public_url") {
            Err(e) => errors.push(e),
            Ok(()) if config.public_domain().is_none() => {
                errors.push(ValidationError::InvalidField {
                    field: "public_url".to_string(),
                    message: "URL must have a valid host".to_string(),
                });
            }
            Ok(()) => {}
        }

        if config.api.url.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "api.url".to_string(),
            });
        } else if let Err(e) = Self::validate_url(&config.api.url, "api.url") {
            errors.push(e);
        }

        if config.api.token.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "api.token".to_string(),
            });
        }

        if config.auth.cookie_secret_salt.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "auth.cookie_secret_salt".to_string(),
            });
        }

        if HeaderName::from_bytes(format!("{}User-Email", config.auth.header_prefix).as_bytes())
            .is_err()
        {
            errors.push(ValidationError::InvalidField {
                field: "auth.header_prefix".to_string(),
                message: "Must only contain characters valid in a header name".to_string(),
            });
        }

        for (field, value) in [
            ("api.timeout_secs", config.api.timeout_secs),
            ("auth.session_ttl_secs", config.auth.session_ttl_secs),
            ("notify.interval_secs", config.notify.interval_secs),
            ("notify.timeout_secs", config.notify.timeout_secs),
            ("wakeup.interval_secs", config.wakeup.interval_secs),
            ("wakeup.timeout_secs", config.wakeup.timeout_secs),
            ("upstream.connect_timeout_secs", config.upstream.connect_timeout_secs),
            (
                "upstream.response_header_timeout_secs",
                config.upstream.response_header_timeout_secs,
            ),
            ("upstream.shutdown_timeout_secs", config.upstream.shutdown_timeout_secs),
        ] {
            if value == 0 {
                errors.push(ValidationError::InvalidField {
                    field: field.to_string(),
                    message: "Must be greater than 0".to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

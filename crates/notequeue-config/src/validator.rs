//! Configuration validation.

use crate::error::ConfigError;
use crate::schema::Config;

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Batch sizes above this are allowed but suspicious.
const LARGE_BATCH_SIZE: u32 = 1000;

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
        let mut result = ValidationResult::default();

        Self::validate_store(config, &mut result);
        Self::validate_queue(config, &mut result);
        Self::validate_logging(config, &mut result);

        Ok(result)
    }

    /// Validate and turn the first error into a `ConfigError`.
    pub fn check(config: &Config) -> Result<ValidationResult, ConfigError> {
        let result = Self::validate(config)?;
        match result.errors.first() {
            Some(error) => Err(ConfigError::InvalidValue {
                field: error.path.clone(),
                message: error.message.clone(),
            }),
            None => Ok(result),
        }
    }

    fn validate_store(config: &Config, result: &mut ValidationResult) {
        if config.store.path.trim().is_empty() {
            result.add_error(ValidationError::new(
                "store.path",
                "Database path cannot be empty",
            ));
        }

        if config.store.busy_timeout_ms == 0 {
            result.add_warning(ValidationWarning::new(
                "store.busy_timeout_ms",
                "busy_timeout_ms is 0, concurrent claimers will fail instead of waiting",
            ));
        }
    }

    fn validate_queue(config: &Config, result: &mut ValidationResult) {
        if config.queue.concurrency == 0 {
            result.add_error(ValidationError::new(
                "queue.concurrency",
                "concurrency must be greater than 0",
            ));
        }

        if config.queue.batch_size == 0 {
            result.add_error(ValidationError::new(
                "queue.batch_size",
                "batch_size must be greater than 0",
            ));
        }

        if config.queue.batch_size > LARGE_BATCH_SIZE {
            result.add_warning(ValidationWarning::new(
                "queue.batch_size",
                format!(
                    "batch_size is very high (>{}), one failed worker holds many locks",
                    LARGE_BATCH_SIZE
                ),
            ));
        }

        if config.queue.poll_interval_ms == 0 {
            result.add_warning(ValidationWarning::new(
                "queue.poll_interval_ms",
                "poll_interval_ms is 0, idle queues will poll every millisecond",
            ));
        }

        if config.queue.stale_after_secs == Some(0) {
            result.add_warning(ValidationWarning::new(
                "queue.stale_after_secs",
                "stale_after_secs is 0, every running task counts as stale on registration",
            ));
        }

        if config.queue.event_capacity == 0 {
            result.add_error(ValidationError::new(
                "queue.event_capacity",
                "event_capacity must be greater than 0",
            ));
        }
    }

    fn validate_logging(config: &Config, result: &mut ValidationResult) {
        if config.logging.file && config.logging.dir.is_none() {
            result.add_warning(ValidationWarning::new(
                "logging.dir",
                "File logging enabled without a directory, will use the default location",
            ));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;

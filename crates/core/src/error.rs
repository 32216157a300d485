//! Error types for the optex engine
//!
//! We use `thiserror` for automatic `Display` and `Error` implementations.
//!
//! Only configuration problems surface as `Err` values: they are detected
//! at protocol construction and fail immediately. Interpreter faults are
//! status values on the transaction handle, and transient conflicts are
//! abort signals recovered locally by the engines — neither crosses a
//! component boundary as an error.

use thiserror::Error;

/// Result alias for protocol construction
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Invalid option combination at protocol construction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A numeric option that must be strictly positive was zero
    #[error("`{option}` must be positive")]
    ZeroOption {
        /// Name of the offending option
        option: &'static str,
    },
}

impl ConfigError {
    /// Check that a numeric option is strictly positive
    pub fn require_positive(option: &'static str, value: usize) -> Result<()> {
        if value == 0 {
            return Err(ConfigError::ZeroOption { option });
        }
        Ok(())
    }
}

//! Configuration trait for validated, consistent configuration across crates

use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Trait for configuration types that can be validated and have defaults
///
/// Context settings and sampling parameters both implement this so the
/// controller can reject a bad run before any tokens are evaluated.
pub trait ValidatedConfig:
    Send + Sync + Clone + Debug + Serialize + for<'de> Deserialize<'de>
{
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate the configuration, returning an error if invalid
    fn validate(&self) -> Result<(), Self::Error>;

    /// Merge this configuration with defaults, preferring this config's values
    fn merge_with_defaults(self, defaults: Self) -> Self;

    /// Get a description of what this configuration controls
    fn description() -> &'static str;

    /// Validate and hand the configuration back on success
    fn validated(self) -> Result<Self, Self::Error> {
        self.validate()?;
        Ok(self)
    }
}

/// Helper trait for configurations that can be created with sensible defaults
pub trait DefaultConfig: ValidatedConfig + Default {
    /// Create a validated default configuration
    fn validated_default() -> Result<Self, Self::Error> {
        Self::default().validated()
    }
}

impl<T> DefaultConfig for T where T: ValidatedConfig + Default {}

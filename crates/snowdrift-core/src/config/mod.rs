//! Configuration helpers shared by the snowdrift binaries.

mod path;
mod vars;

pub use path::CliArgs;
pub use vars::{InterpolationResult, interpolate, interpolate_with};

use std::path::Path;

use crate::error::{ConfigError, EnvInterpolationSnafu, ReadFileSnafu};
use snafu::prelude::*;

/// Read a configuration file and expand environment variables in it.
///
/// Every unresolved variable is reported at once.
pub fn read_interpolated(path: &Path) -> Result<String, ConfigError> {
    let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    interpolate_text(&contents)
}

/// Expand environment variables in configuration text.
pub fn interpolate_text(contents: &str) -> Result<String, ConfigError> {
    let result = interpolate(contents);
    ensure!(
        result.is_ok(),
        EnvInterpolationSnafu {
            message: result.errors.join("\n"),
        }
    );
    Ok(result.text)
}

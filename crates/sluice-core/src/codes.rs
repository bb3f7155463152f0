//! Stable error codes for pipeline failures.
//!
//! All codes are SCREAMING_SNAKE_CASE and stable across versions.

/// A specifier could not be resolved to a file or external.
pub const RESOLVE_FAILED: &str = "RESOLVE_FAILED";

/// A transform in a module's chain failed.
pub const TRANSFORM_FAILED: &str = "TRANSFORM_FAILED";

/// Two artifacts target the same output path with different bytes.
pub const EMIT_CONFLICT: &str = "EMIT_CONFLICT";

/// A plugin callback returned an error.
pub const PLUGIN_FAILED: &str = "PLUGIN_FAILED";

/// A source file could not be read.
pub const READ_FAILED: &str = "READ_FAILED";

/// An output file could not be written.
pub const WRITE_FAILED: &str = "WRITE_FAILED";

/// A configured entry point does not exist.
pub const ENTRY_NOT_FOUND: &str = "ENTRY_NOT_FOUND";

/// The configuration file is missing, malformed, or inconsistent.
pub const CONFIG_INVALID: &str = "CONFIG_INVALID";

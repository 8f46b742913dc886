//! Stable exit codes for runner CLI commands.

/// A flag was found (and printed on stdout), or the command succeeded.
pub const OK: i32 = 0;
/// The session ended without a flag.
pub const NOT_FOUND: i32 = 1;
/// Invalid arguments, config or challenge layout, or another setup error.
pub const INVALID: i32 = 2;

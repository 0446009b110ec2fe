//! Core shared types and constants for Gantry.
//!
//! This crate is intentionally small and dependency-free so that every other
//! crate in the workspace can depend on it without pulling anything else in.

/// The Gantry version baked into this build.
///
/// The workspace `Cargo.toml` is the single source of truth; every crate
/// inherits its version from there, so this constant is the same string in
/// every member of a given build.
pub const GANTRY_VERSION: &str = env!("CARGO_PKG_VERSION");

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared utilities for haste.
//!
//! Pure helpers with no logging/tracing dependencies. Logging belongs to
//! the engine and the CLI.

pub mod fs;
pub mod hash;

//! Shared infrastructure for the parlor workspace: logging setup, password
//! hashing and `.env`-style configuration files.

pub mod env;
pub mod logging;
pub mod passwd;

//! Core crate for the snuabar generation job server.

pub mod config;
pub mod fingerprint;
pub mod job;
pub mod locator;
pub mod logging;
pub mod registry;
pub mod relocate;
pub mod server;
pub mod upstream;
pub mod workflow;

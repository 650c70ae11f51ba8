//! Therapy Simulator Client Library Crate
//!
//! This library contains the networked half of the session core: the HTTP
//! gateway to the dialogue backend, credential and transport seams, and the
//! orchestrator task that drives a session. The `console` binary is a thin
//! wrapper around this library.

pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod models;
pub mod orchestrator;
pub mod transport;

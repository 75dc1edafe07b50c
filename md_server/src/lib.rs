//! HTTP and WebSocket front end for the matchday scheduler.
//!
//! The binary wires a registry export, a mutation log store, the schedule
//! engine and the realtime hub together and serves them through [`api`].

pub mod api;
pub mod config;
pub mod logging;
pub mod metrics;

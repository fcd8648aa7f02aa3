//! Callboard server: polls the vendor queue API through the dashboard proxy,
//! detects changes by fingerprint, and pushes `dataUpdate` frames to every
//! connected dashboard over WebSocket.

pub mod app;
pub mod broadcast;
pub mod config;
pub mod fetcher;
pub mod routes;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod upstream;
pub mod watch;

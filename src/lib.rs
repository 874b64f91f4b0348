//! Encrypted media conversion over TCP: a client uploads a file with an
//! operation, the server runs it through ffmpeg and streams the result back.

pub mod audit;
pub mod client;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod session;
pub mod startup;
pub mod transfer;

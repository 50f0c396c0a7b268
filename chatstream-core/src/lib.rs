pub mod assembler;
pub mod auth;
pub mod classifier;
pub mod config;
pub mod error;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod parser;
pub mod scheduler;
pub mod session;
pub mod stream;
pub mod telemetry;
pub mod transport;

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! tunnelgate library — the building blocks of the gateway binary.
//!
//! - `tokens` — tunnel tokens, the registry and its expiry sweep
//! - `backend` — starting and stopping remote tunnels
//! - `ws` — upgrade handshake and the WebSocket/TCP relay
//! - `gateway` — composition root and shutdown hook
//! - `cors` — cross-origin response headers
//! - `routes` — lifecycle and health endpoints, router assembly
//! - `auth` — bearer key middleware
//! - `config` — configuration loading

pub mod auth;
pub mod backend;
pub mod config;
pub mod cors;
pub mod error;
pub mod gateway;
pub mod routes;
pub mod state;
pub mod tokens;
pub mod ws;

pub use backend::{BackendError, CommandBackend, TunnelBackend};
pub use config::Config;
pub use error::GatewayError;
pub use gateway::TunnelGateway;
pub use state::AppState;
pub use tokens::token::{RemoteHandle, TokenView, TunnelToken};
pub use tokens::TokenRegistry;

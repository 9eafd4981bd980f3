//! # gatewatch-client - Gateway RPC Client and Connection Supervisor
//!
//! Maintains one persistent, authenticated WebSocket connection to an agent
//! gateway, multiplexes concurrent JSON requests over it, forwards pushed
//! events to a handler, and watches gateway liveness.
//!
//! Depends on [`gatewatch_core`] for error handling and logging.
//!
//! ## Public API
//!
//! ### Client
//! - [`GatewayClient`] - Supervised connection, requests, events, health
//! - [`ConnectionState`] - Lifecycle of the supervised connection
//! - [`ClientConfig`] - Host, credentials, backoff and health settings
//!
//! ### Wire Protocol
//! - [`parse_frame()`] - Decode a text message into a typed [`Frame`]
//! - [`RequestFrame`], [`ResponseFrame`], [`EventFrame`] - Frame shapes
//! - [`ws`] - Minimal RFC 6455 client transport
//!
//! ### Device Identity
//! - [`DeviceIdentity`] - Persisted Ed25519 keypair used to sign the handshake
//! - [`fingerprint()`], [`verify_signature()`] - Key and signature helpers
//!
//! ### Health
//! - [`HealthStatus`], [`HealthNotice`] - Monitor snapshot and restart outcomes

pub mod client;
pub mod config;
pub mod connection;
pub mod events;
pub mod handshake;
pub mod health;
pub mod identity;
pub mod pending;
pub mod protocol;
pub mod ws;

// Public API re-exports
pub use client::{GatewayClient, HANDSHAKE_TIMEOUT};
pub use config::{
    discover_gateway_token, state_dir, BackoffConfig, ClientConfig, ClientInfoConfig,
    HealthConfig, DEFAULT_PORT,
};
pub use connection::{Backoff, ConnectionState, CLOSE_TIMEOUT};
pub use events::EventHandler;
pub use handshake::{build_connect_params, DeviceAuthPayload};
pub use health::{HealthNotice, HealthStatus, NotifyCallback, ProbeMethod, RestartCallback};
pub use identity::{default_identity_path, fingerprint, verify_signature, DeviceIdentity};
pub use protocol::{
    parse_frame, ErrorCode, ErrorShape, EventFrame, Frame, RequestFrame, ResponseFrame,
    PROTOCOL_VERSION,
};

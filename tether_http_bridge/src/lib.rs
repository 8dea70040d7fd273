//! # Tether HTTP Bridge
//!
//! An HTTP-to-stdio bridge for line-delimited JSON-RPC services.
//!
//! This crate provides an HTTP server that relays JSON-RPC messages to a
//! single long-lived subprocess speaking newline-delimited JSON over its
//! standard input/output, enabling HTTP clients to talk to services
//! restricted to the stdio transport.
//!
//! ## Architecture
//!
//! *   **[`frame`]**: a pull-based decoder turning the subprocess's
//!     arbitrarily-chunked stdout bytes into discrete JSON messages, one
//!     per newline-terminated frame.
//! *   **[`relay`]**: owns the subprocess and the pending-request
//!     registry; messages carrying an `id` suspend the caller until the
//!     matching response arrives, a per-request timeout elapses, or the
//!     subprocess exits. Notifications complete immediately.
//! *   **[`bridge`]**: the axum HTTP surface — `GET /health`, `POST` of a
//!     single message or a concurrent batch, and JSON-shaped failures for
//!     everything that goes wrong.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tether_http_bridge::{BridgeConfig, DEFAULT_MAX_BODY_BYTES, start_bridge};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig {
//!         bind_addr: "127.0.0.1:3000".parse()?,
//!         command: "my-jsonrpc-service".to_string(),
//!         args: vec![],
//!         env: vec![],
//!         request_timeout: Duration::from_secs(15),
//!         max_body_bytes: DEFAULT_MAX_BODY_BYTES,
//!     };
//!     start_bridge(config).await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod error;
pub mod frame;
pub mod relay;

pub use bridge::{BridgeConfig, DEFAULT_MAX_BODY_BYTES, start_bridge};
pub use error::{BridgeError, Result};
pub use frame::ReadBuffer;
pub use relay::{Relay, RelayConfig};

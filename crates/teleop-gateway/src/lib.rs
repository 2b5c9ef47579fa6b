//! `teleop-gateway` – The Operator Front Door
//!
//! A lightweight HTTP + WebSocket server (default port `8080`) that:
//!
//! 1. **Executes** session, telemetry and camera requests sent as one JSON
//!    message per WebSocket frame (see [`protocol`]), answering each with an
//!    `ok`/`error` envelope carrying a stable error code.
//! 2. **Pushes** session transitions and system alerts from the
//!    [`EventBus`][teleop_middleware::EventBus] to every connected client,
//!    so dashboards need not poll.
//! 3. **Throttles** status reports per robot with a keyed `governor` rate
//!    limiter.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use teleop_gateway::{Dispatcher, GatewayServer};
//! use teleop_middleware::EventBus;
//! use teleop_store::{Database, Stores};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = Arc::new(EventBus::default());
//!     let stores = Stores::new(Database::open_in_memory()?);
//!     GatewayServer::new(Dispatcher::new(stores), bus).run().await?;
//!     Ok(())
//! }
//! ```

pub mod protocol;
pub mod server;

pub use protocol::{
    DEFAULT_TELEMETRY_RATE_PER_SEC, Dispatcher, ErrorBody, GatewayError, Request, Response,
};
pub use server::{DEFAULT_PORT, GatewayServer};

//! `teleop-runtime` – The Live Session
//!
//! Everything that runs while an operator holds a robot.
//!
//! # Modules
//!
//! - [`bridge`] – [`TransportBridge`][bridge::TransportBridge]: owns a
//!   session's data and media channels, sends control frames without ever
//!   waiting on backpressure, routes the robot's inbound JSON frames to the
//!   stores, and tears the transport down when the session ends.
//! - [`control_loop`] – [`ControlLoop`][control_loop::ControlLoop]: the
//!   periodic sample → filter → encode → send loop, halted within one tick
//!   by session transitions pushed over the event bus.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with optional OTLP span export.

pub mod bridge;
pub mod control_loop;
pub mod telemetry;

pub use bridge::{BridgeError, BridgeStats, DATA_CHANNEL_LABEL, InboundFrame, TransportBridge};
pub use control_loop::{ControlLoop, ControlLoopConfig, DEFAULT_TICK, LoopExit};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};

//! `teleop-middleware` – The Nervous System
//!
//! Routes asynchronous data between the session registry, the transport and
//! operator-facing clients without caring about the data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – Headless, topic-based publish/subscribe event bus built on
//!   Tokio broadcast channels.
//! - [`notifier`] – the [`Notifier`] interface injected into components that
//!   surface user-facing messages.
//! - [`transport`] – [`DataChannel`] / [`MediaChannel`] abstractions for the
//!   real-time link to a robot, with UDP and in-process loopback
//!   implementations.

pub mod bus;
pub mod notifier;
pub mod transport;

pub use bus::{EventBus, Topic, TopicReceiver};
pub use notifier::{BusNotifier, Notifier, RecordingNotifier, TracingNotifier};
pub use transport::{
    DataChannel, LoopbackDataChannel, LoopbackMediaChannel, MediaChannel, UdpDataChannel,
    loopback_pair,
};

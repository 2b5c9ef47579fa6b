//! `teleop-hal` – The Operator Input Edge
//!
//! Everything between the operator's physical input device and the bytes
//! handed to the transport.
//!
//! # Modules
//!
//! - [`filter`] – [`InputFilter`][filter::InputFilter]: deadzone clamping of
//!   raw axis samples, run once per polling tick.
//! - [`codec`] – [`ChannelCodec`][codec::ChannelCodec]: packs N analog
//!   channels into a fixed-size 10-bit-per-channel binary frame and back.
//! - [`input`] – the [`InputSource`][input::InputSource] trait implemented by
//!   device drivers, plus a scripted source for simulation and tests.

pub mod codec;
pub mod filter;
pub mod input;

pub use codec::{ChannelCodec, CodecError};
pub use filter::{FilterError, InputFilter};
pub use input::{InputSource, LatchedInput, ScriptedInput};

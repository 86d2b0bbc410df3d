//! # coms-core
//!
//! Types shared by every coms crate:
//!
//! - [`envelope`]: the one-object-per-frame wire envelope
//! - [`errors`]: handler error type and the error codes that travel on the wire
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod logging;

pub use envelope::{Envelope, EnvelopeError, EnvelopeType, ErrorBody};
pub use errors::HandlerError;

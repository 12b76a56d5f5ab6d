//! Telemetry for admission decisions.
//!
//! The gate emits one [`AdmissionEvent`] per completed decision. Events flow
//! through [`EventSink`] implementations, expressed as
//! `tower::Service<AdmissionEvent>` for composability: log them, keep them in
//! memory, broadcast them, or queue them in front of a slow consumer with
//! [`BoundedSink`].
//!
//! Emission is fire-and-forget. A sink that errors, lags, or fills its queue
//! loses events; it never delays or fails an admission decision.

pub mod events;
pub mod sinks;

pub use events::{event_to_json, AdmissionEvent};
pub use sinks::{
    emit_best_effort, BoundedSink, EventSink, LogSink, MemorySink, NullSink, StreamingSink,
};

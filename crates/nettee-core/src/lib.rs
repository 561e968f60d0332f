//! nettee-core: a bidirectional stream relay that tees each direction.
//!
//! Accepts connections on a local endpoint, pairs each with a fresh
//! connection to a fixed remote, and copies bytes both ways while duplicating
//! client→remote traffic into a send [`Sink`] and remote→client traffic into
//! a receive [`Sink`]. Concurrency is capped by an [`AdmissionGate`].

pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod relay;
pub mod sink;
pub mod transport;
pub mod udp;

// Re-export commonly used items at crate root.
pub use config::RelayConfig;
pub use engine::{EngineState, RelayEngine};
pub use error::{TeeError, TeeResult};
pub use gate::{AdmissionGate, AdmissionToken};
pub use relay::{Direction, DirectionEnd, Relay, RelayOptions, RelayReport};
pub use sink::{JsonLinesSink, MemorySink, SharedWriter, Sink, WriterSink};
pub use transport::{BoxedStream, Endpoint, Protocol};

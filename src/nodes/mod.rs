//! Connected node sessions and operator-driven invocations.

mod invoker;
mod registry;

pub use invoker::{InvokeError, InvokeOutcome, InvokeRequest, Invoker};
pub use registry::{EventSink, NodeSession, Registry};

//! Request orchestration: admission, accelerator arbitration, per-backend
//! workers and lifecycle control.

mod arbiter;
mod lifecycle;
mod orchestrator;
mod queue;
mod registry;
mod request;
mod worker;

pub use arbiter::{AcceleratorPermit, ResourceArbiter};
pub use lifecycle::LifecycleManager;
pub use orchestrator::{AcceleratorStatus, HealthReport, Orchestrator};
pub use queue::RequestQueue;
pub use registry::BackendStatus;
pub use request::{Completion, HistoryStatus, Request, RequestId, RequestStatus, Ticket};

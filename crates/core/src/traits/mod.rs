pub mod event_bus;
pub mod queue_store;
pub mod registry_store;
pub mod sandbox_backend;
pub mod task_handler;
pub mod task_router;

pub use event_bus::*;
pub use queue_store::*;
pub use registry_store::*;
pub use sandbox_backend::*;
pub use task_handler::*;
pub use task_router::*;

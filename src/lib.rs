/// wkf-emulator: in-process emulation of a durable workflow backend
///
/// Stores workflow runs, steps, events, hooks and queue messages per logical
/// database name, answers the backend's HTTP API and worker socket protocol,
/// and resumes runs whose waits have elapsed.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by the service and the gateway
pub mod error;

// Record stores, snapshot persistence and the store registry
pub mod store;

// Record service - the only mutation path into the stores
pub mod service;

// Background runtime - queue broker and wait scheduler
pub mod runtime;

// HTTP and WebSocket layer - record API routes, interception, worker socket
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use api::Gateway;
pub use error::{EmulatorError, EmulatorResult};
pub use runtime::{QueueBroker, WaitScheduler};
pub use server::{start_server, Emulator};
pub use service::WorkflowService;
pub use store::StoreRegistry;

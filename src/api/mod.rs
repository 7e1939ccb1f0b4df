/// Protocol Gateway
///
/// The HTTP and WebSocket faces of the emulated backend:
/// - Record API routes under `/api/workflows`
/// - Interception entry points for hosting the gateway in front of another router
/// - The worker socket endpoint wrapping the queue broker

// Record API endpoints
pub mod routes;

// Request interception and pass-through
pub mod gateway;

// Worker socket endpoint
pub mod ws;

// Re-export router builders
pub use gateway::{intercepts, Gateway};
pub use routes::{create_record_routes, ApiState, API_PREFIX};
pub use ws::create_socket_routes;

/// Background Runtime
///
/// The two periodic activities of the emulator:
/// - The socket broker's poll loop pushing queue messages to subscribed workers
/// - The wait scheduler resuming runs whose delays have elapsed

// Subscription table and job dispatch to worker connections
pub mod broker;

// Recurring wait resolution over every known database
pub mod scheduler;

// Re-export main types
pub use broker::{BrokerConnection, QueueBroker, RoundRobin, UniformRandom, WorkerSelector};
pub use scheduler::WaitScheduler;

// Task implementations, the context they share and the webhook servers.

pub mod context;
pub mod outcome;
pub mod server;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use context::TaskContext;
pub use outcome::TaskOutcome;

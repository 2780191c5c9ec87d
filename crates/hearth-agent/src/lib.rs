pub mod config;
pub mod console;
pub mod events;
pub mod presence;
pub mod sampler;
pub mod store;
pub mod supervisor;

pub use config::AgentConfig;
pub use events::{AgentEvent, EventBroadcaster, LogLine, LogStream};
pub use store::{MemoryPlayerStore, PlayerStore};
pub use supervisor::{LaunchSpec, SessionInfo, Supervisor, SupervisorError};

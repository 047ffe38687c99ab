pub mod command;
pub mod echo;
pub mod registry;

pub use command::CommandAgent;
pub use echo::EchoAgent;
pub use registry::AgentRegistry;

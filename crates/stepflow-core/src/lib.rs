pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ExecutorError, FlowError, Result, TemplateError, ValidationError};
pub use event::EventBus;
pub use types::*;

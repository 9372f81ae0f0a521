pub mod cancellation;
pub mod config;
pub mod context;
pub mod engine;
pub mod event_bus;
pub mod history;

pub use cancellation::*;
pub use config::*;
pub use context::*;
pub use engine::*;
pub use event_bus::*;
pub use history::*;

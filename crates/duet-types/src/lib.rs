pub mod chat;
pub mod event;
pub mod provider;

pub use chat::*;
pub use event::*;
pub use provider::*;

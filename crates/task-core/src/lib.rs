pub mod config;
pub mod events;
pub mod prompt;
pub mod stream;
pub mod types;

pub use config::Config;
pub use events::{PhaseEvent, TaskEvent};
pub use stream::StreamLine;
pub use types::*;

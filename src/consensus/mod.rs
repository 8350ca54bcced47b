pub mod message;
pub mod monitor;
pub mod peers;
pub mod processor;
pub mod state;

pub use message::*;
pub use monitor::*;
pub use peers::*;
pub use processor::*;
pub use state::*;

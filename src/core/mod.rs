pub mod config;
pub mod events;
pub mod frame;
pub mod output;
pub mod segment;


pub use config::*;
pub use events::*;
pub use frame::*;
pub use output::*;
pub use segment::*;

pub mod controller;
pub mod engine;
pub mod queue;
pub mod reorder;
pub mod segments;
pub mod worker;


pub use controller::*;
pub use engine::*;
pub use queue::*;
pub use reorder::*;
pub use segments::*;
pub use worker::*;

pub mod core;
pub mod pipeline;
pub mod video;

#[cfg(test)]
mod test_utils;

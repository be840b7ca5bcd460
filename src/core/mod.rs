//! Core execution engine: the task model, engine seams, the model pool,
//! and the background processor.

pub mod engine;
pub mod pool;
pub mod processor;
pub mod task;

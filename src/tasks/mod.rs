//! Background Tasks Module
//!
//! Host-side maintenance that runs alongside an engine instance. The engine
//! itself never spawns tasks or threads.
//!
//! # Tasks
//! - Garbage collection: forced GC sweeps at a configured interval

mod gc;

pub use gc::spawn_gc_task;

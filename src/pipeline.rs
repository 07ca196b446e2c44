// src/pipeline.rs
pub mod cluster;
pub mod config;
pub mod context;
pub mod fault;
pub mod global_cache;
pub mod io;
pub mod item;
pub mod record;
pub mod registry;
pub mod stage;
pub mod stream;
pub mod transform;

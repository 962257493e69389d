pub mod config;
pub mod dataset;
pub mod events;
pub mod models;
pub mod program;
pub mod runs;
pub mod signatures;

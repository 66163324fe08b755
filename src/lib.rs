pub mod app;
pub mod cli;
pub mod config;
pub mod detection;
pub mod emitter;
pub mod model;
pub mod store;
pub mod timer;
pub mod tracker;
pub mod ui;
pub mod util;

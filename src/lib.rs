#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod board;
pub mod config;
pub mod data;
pub mod embed;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod markup;
pub mod media;
pub mod model;
pub mod quote;
pub mod render;
pub mod storage;
pub mod sync;
pub mod view;
pub mod viewer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, RunOptions};

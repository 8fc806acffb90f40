pub mod bridge;
pub mod config;
pub mod logging;

pub use axis_bridge_types as types;

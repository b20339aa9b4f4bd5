//! capllama ABI crate: stable contracts shared by the plugin host and native delegates.

pub mod ffi;
pub mod model;
pub mod params;
pub mod results;

pub use model::*;
pub use params::*;
pub use results::*;

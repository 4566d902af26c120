pub mod config;
pub mod disk;
pub mod error;
pub mod gadget;
pub mod layout;
pub mod pipeline;
pub mod prepare;
pub mod size;
pub mod tools;

pub use error::{Error, Result};

#[macro_use]
extern crate log;

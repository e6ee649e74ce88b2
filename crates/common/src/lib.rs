//! Common types shared by the voice tool gateway crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, load_secret};

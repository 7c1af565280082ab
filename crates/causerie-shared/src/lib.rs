pub mod constants;
pub mod error;
pub mod events;
pub mod types;

pub use error::ErrorKind;
pub use types::*;

pub mod error;
pub mod value;

pub use error::{Result, SyncError};

pub mod error;
pub mod models;
pub mod time;

pub use error::ValidationError;

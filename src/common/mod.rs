pub mod config;
pub mod error;
pub mod paths;

pub use config::Config;
pub use error::{AttendanceError, Result};
pub use paths::Paths;

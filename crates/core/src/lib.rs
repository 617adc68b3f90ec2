pub mod cadence;
pub mod config;
pub mod error;
pub mod job;
pub mod tz;

pub use cadence::*;
pub use config::Config;
pub use error::*;
pub use job::*;

pub mod config;
pub mod error;
pub mod loader;
pub mod logger;
pub mod plugin;
pub mod router;
pub mod util;

pub use error::RouterError;

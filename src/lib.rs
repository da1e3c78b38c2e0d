pub mod clock;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod proxy;
pub mod security;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use monitoring::*;
pub use proxy::*;
pub use security::*;

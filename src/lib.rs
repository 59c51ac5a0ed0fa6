pub mod bootstrap;
pub mod channel;
pub mod config;
pub mod error;
pub mod gpio;
pub mod logging;
pub mod pollset;
pub mod spi;
pub mod transaction;

pub use channel::N_CHANNEL;

pub mod disk;
pub mod driver;
pub mod error;
pub mod network;
pub mod port;
pub mod seed;
pub mod settings;
pub mod ssh_client;
pub mod status;
pub mod vbox;
pub mod wait;

#[cfg(test)]
pub mod mocks;

pub use driver::NodeDriver;
pub use error::{DriverError, Result};
pub use settings::Settings;
pub use status::VmState;

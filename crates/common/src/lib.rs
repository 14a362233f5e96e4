pub mod bundle;
pub mod certdb;
pub mod conf;
pub mod config;
pub mod error;
pub mod logging;
pub mod names;
pub mod net;
pub mod os;
pub mod patch;
pub mod prompt;
pub mod system;
pub mod version;

pub use config::Config;
pub use error::Error;
pub use names::{ClientName, DnsServers, ServerAddr, Validity};
pub use system::{Cmd, CommandRunner, Output, SystemRunner};
pub use version::{Capabilities, SwanVersion};

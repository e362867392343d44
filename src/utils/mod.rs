pub mod constants;
pub mod config_loader;
pub mod time;

pub use constants::*;
pub use config_loader::*;
pub use time::unix_now;

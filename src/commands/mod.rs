//! CLI command handlers.
//!
//! Each submodule handles a specific CLI command:
//! - `convert` - Convert an image into a storage target
//! - `prepare` - Write host identity into a guest root
//! - `probe` - Show what qemu-img reports for an image
//! - `lookup` / `mac` - Address discovery for prepared guests
//! - `preflight` - Run preflight checks
//! - `show` - Display information

mod convert;
mod lookup;
mod prepare;
mod preflight;
mod probe;
pub mod show;

pub use convert::{cmd_convert, ConvertArgs};
pub use lookup::{cmd_lookup, cmd_mac};
pub use prepare::{cmd_prepare, PrepareArgs};
pub use preflight::cmd_preflight;
pub use probe::cmd_probe;
pub use show::cmd_show;

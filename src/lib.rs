// Library interface for scrubbox
// The binary and the integration of both tiers import the modules from here

pub mod cli;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod os;
pub mod prelude;
pub mod webapp;

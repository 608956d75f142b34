pub mod config;
pub mod detector;
pub mod files;
pub mod properties;
pub mod supervisor;
pub mod utils;

pub mod analyze;
pub mod config;
pub mod db;
pub mod error;
pub mod merge;

pub mod api;
pub mod bootstrap;
pub mod ca;
pub mod config;
pub mod db;
pub mod error;
pub mod ipam;
pub mod profile;
pub mod provision;
pub mod tokens;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

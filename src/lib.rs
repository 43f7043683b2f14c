pub mod api;
pub mod config;
pub mod course;
pub mod db;
pub mod enrollment;
pub mod error;
pub mod lesson;
pub mod pagination;
pub mod progress;
pub mod review;
pub mod role;
pub mod user;
pub mod utils;

pub use error::{Error, Result};

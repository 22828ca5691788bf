pub mod batch;
pub mod config;
pub mod convert;
pub mod corpus;
pub mod diagnostics;
pub mod discover;
mod error;
pub mod extract;
pub mod fetch;
pub mod http;
pub mod inspect;
pub mod logs;
pub mod paths;
pub mod render;
pub mod select;
pub mod upload;

pub use error::{BatchAction, Result, UpsizerError};

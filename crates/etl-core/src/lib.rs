pub mod action;
pub mod dates;
pub mod document;
pub mod endpoint;
pub mod error;
pub mod etl_config;
pub mod io;
pub mod lock;
pub mod options;
pub mod overseer;
pub mod overseer_options;
pub mod paths;
pub mod pointer;
pub mod query;
pub mod types;
pub mod variables;

pub use error::{EtlError, Result};

pub mod config;
pub mod counter;
pub mod error;
pub mod feed;
pub mod key;
pub mod logging;
pub mod maintainer;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pipeline;
pub mod projection;
pub mod query;
pub mod seq;
pub mod service;
pub mod store;
pub mod token;
pub mod validation;

pub use error::{ReadHistoryError, Result};
pub use service::ReadHistoryService;

pub mod config;
pub mod duration;
pub mod namespace;
pub mod types;

pub use config::NsgridConfig;
pub use duration::parse_duration;
pub use namespace::{DEFAULT_NAMESPACE, NamespaceError, is_default_namespace, validate_namespace};
pub use types::*;

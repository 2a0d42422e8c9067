pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigLoader, ConfigOverrides, load_config};
pub use models::*;
pub use validation::{ConfigValidator, ValidationError, ValidationResult};

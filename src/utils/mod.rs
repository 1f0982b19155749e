pub mod events;
pub mod logging;
pub mod time;
pub mod url_validation;

pub use events::EventEmitter;
pub use logging::init_tracing;
pub use time::now_ms;
pub use url_validation::{UrlValidationError, validate_endpoint_url};

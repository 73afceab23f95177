pub mod context;
pub mod error;
pub mod module;
pub mod types;

pub use context::{ClientContext, DataApi, OutboundRequest, OutboundResponse, QueryPage};
pub use error::ServiceError;
pub use module::Module;
pub use types::new_id;

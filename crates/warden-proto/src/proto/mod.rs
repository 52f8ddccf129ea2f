mod error;
mod model;
mod rpc;
mod types;

pub use error::*;
pub use model::*;
pub use rpc::*;
pub use types::*;

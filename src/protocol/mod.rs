pub mod body;
pub mod chunk;
mod error;
mod request;

pub use body::{BodyBuf, BodyStream, DrainOutcome, OnTooLarge, RequestBody};
pub use chunk::ChunkBuf;
pub use error::BodyError;
pub use request::RequestHeader;

#[macro_use]
mod macros;

pub mod consumer;
pub mod message;
pub mod poke;
pub mod stream_name;
pub mod token;

pub use consumer::ConsumerGroup;
pub use message::{Message, WriteMessage, CORRELATION_KEY};
pub use poke::Poke;
pub use stream_name::{CardinalId, Category, InvalidStreamName, StreamName};

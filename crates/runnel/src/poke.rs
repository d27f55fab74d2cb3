use crate::stream_name::Category;
use crate::Message;

/// A transient notification emitted after a successful write commit.
///
/// Pokes carry position information, not the payload: subscribers re-read
/// from the store when poked. Delivery is best-effort.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Poke {
    pub stream_name: String,
    pub category: String,
    pub position: u64,
    pub global_position: u64,
    /// Category of the message's `correlationStreamName` metadata, when
    /// present. Used by the subscription bus to evaluate correlation
    /// filters in-process; never serialized.
    pub correlation_category: Option<String>,
}

impl Poke {
    pub fn of(message: &Message<'_>) -> Self {
        Poke {
            stream_name: message.stream_name.to_string(),
            category: message.stream_name.category().into_string(),
            position: message.position,
            global_position: message.global_position,
            correlation_category: message
                .correlation_stream_name()
                .map(|name| Category::of(name).into_string()),
        }
    }
}

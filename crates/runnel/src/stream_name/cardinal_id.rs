use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::StreamName;

/// A stream's cardinal id: the suffix of a stream name after the first `-`,
/// or the whole name when no `-` is present.
///
/// The cardinal id is the unit of consumer-group partitioning: all messages
/// of one cardinal id are delivered to the same group member.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CardinalId<'a>(pub(crate) Cow<'a, str>);

impl<'a> CardinalId<'a> {
    /// Splits the cardinal id out of a raw stream name string.
    pub fn of(stream_name: &str) -> CardinalId<'_> {
        let id = stream_name
            .split_once(StreamName::ID_SEPARATOR)
            .map(|(_, id)| id)
            .unwrap_or(stream_name);
        CardinalId(Cow::Borrowed(id))
    }
}

impl_eq! { CardinalId<'a>, &'b str }
impl_eq! { CardinalId<'a>, String }
impl_as_ref_str! { CardinalId, CardinalId<'a>, CardinalId<'static> }

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::StreamName;

/// A stream category: the prefix of a stream name up to the first `-`.
///
/// The set of all streams sharing a category can be read as one ordered
/// sequence via the category reader.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Category<'a>(pub(crate) Cow<'a, str>);

impl<'a> Category<'a> {
    /// Splits the category out of a raw stream name string.
    pub fn of(stream_name: &str) -> Category<'_> {
        let category = stream_name
            .split_once(StreamName::ID_SEPARATOR)
            .map(|(category, _)| category)
            .unwrap_or(stream_name);
        Category(Cow::Borrowed(category))
    }
}

impl_eq! { Category<'a>, &'b str }
impl_eq! { Category<'a>, String }
impl_as_ref_str! { Category, Category<'a>, Category<'static> }

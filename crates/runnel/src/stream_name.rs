//! Events are written to and read from streams, and the subject stream is
//! identified by its name.
//!
//! A stream name is an opaque string that, by convention, carries a *category*
//! and a *cardinal id* separated by the first dash (`-`) character. The part
//! preceding the first dash is the category; the part following it is the
//! cardinal id. Subsequent dashes belong to the cardinal id.
//!
//! `account-123` is a stream in the `account` category with cardinal id `123`.
//! `account-2024-01` is still in the `account` category; its cardinal id is
//! `2024-01`. A name with no dash, such as `account`, is its own category and
//! its own cardinal id.
//!
//! Categories group streams for cross-stream reads; cardinal ids are the unit
//! of consumer-group partitioning.

mod cardinal_id;
mod category;

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::cardinal_id::CardinalId;
pub use self::category::Category;

/// A stream name containing a category and a cardinal id.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamName<'a>(Cow<'a, str>);

impl<'a> StreamName<'a> {
    /// Cardinal id separator.
    ///
    /// Only the first `-` is the separator; all other `-` characters belong
    /// to the cardinal id.
    pub const ID_SEPARATOR: char = '-';

    /// Creates a stream name, validating it is non-empty and free of NUL
    /// bytes (NUL is the storage key separator).
    pub fn new(stream_name: impl Into<Cow<'a, str>>) -> Result<Self, InvalidStreamName> {
        let stream_name = stream_name.into();
        if stream_name.is_empty() {
            return Err(InvalidStreamName::Empty);
        }
        if stream_name.contains('\0') {
            return Err(InvalidStreamName::Nul);
        }

        Ok(StreamName(stream_name))
    }

    /// The category part: everything up to the first `-`, or the whole name
    /// when no `-` is present.
    pub fn category(&self) -> Category<'_> {
        Category::of(&self.0)
    }

    /// The cardinal id part: everything after the first `-`, or the whole
    /// name when no `-` is present.
    pub fn cardinal_id(&self) -> CardinalId<'_> {
        CardinalId::of(&self.0)
    }
}

impl_eq! { StreamName<'a>, &'b str }
impl_eq! { StreamName<'a>, String }
impl_as_ref_str! { StreamName, StreamName<'a>, StreamName<'static> }

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum InvalidStreamName {
    #[error("empty stream name")]
    Empty,
    #[error("stream name contains a NUL byte")]
    Nul,
}

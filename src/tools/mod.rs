//! Small shared utilities.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;

pub mod ids;

/// A pinned, boxed byte stream used for streaming uploads without tying
/// adapters to a specific stream implementation.
pub type PinnedBytesStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Unpin + Send>>;

//! Codec traits.
//!
//! The `Decoder`/`Encoder` pair bridges byte buffers and framed items. The
//! frame codec in [`frame`](crate::frame) implements both; anything that
//! replaces the default frame handler can reuse the same seam.

use bytes::BytesMut;
use std::io;

/// Decodes items out of an accumulation buffer.
///
/// `decode` is called whenever new bytes have been appended to `src`. It
/// consumes as much of `src` as it can and returns `Ok(Some(item))` per
/// complete item, or `Ok(None)` when more bytes are needed. Partial input
/// must be left in `src` untouched.
pub trait Decoder {
    /// The decoded item type.
    type Item;
    /// Decoding error type.
    type Error: From<io::Error>;

    /// Attempt to decode one item from the front of `src`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error>;
}

/// Encodes items into an output buffer.
pub trait Encoder<Item> {
    /// Encoding error type.
    type Error: From<io::Error>;

    /// Append the wire form of `item` to `dst`.
    fn encode(&mut self, item: Item, dst: &mut BytesMut) -> Result<(), Self::Error>;
}

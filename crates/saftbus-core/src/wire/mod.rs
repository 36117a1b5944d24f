//! Schema-less binary codec.
//!
//! Values are written without type tags; the receiver must decode exactly
//! the sequence of types the sender encoded. Layout:
//!
//! ```text
//! integers      fixed width, little endian
//! bool          1 byte (0 or 1)
//! char          u32
//! str / bytes   u32 byte count, payload
//! sequence      u32 byte count of the encoded elements, elements
//!               (non-empty sequences of zero-sized elements are rejected)
//! map           u32 entry count, (key, value) pairs in iteration order
//! option        1 byte (0 = none, 1 = some), value
//! enum          u32 variant index, variant payload
//! struct/tuple  fields in order, no header
//! ```
//!
//! Any serde-serializable type can be encoded. [`Writer`] and [`Reader`]
//! expose the put/get cursor style used by hand-written dispatch code:
//!
//! ```
//! use saftbus_core::wire::{Reader, Writer};
//!
//! let mut w = Writer::new();
//! w.put(&5i32).unwrap();
//! w.put("/demo/counter").unwrap();
//! let bytes = w.into_bytes();
//!
//! let mut r = Reader::new(&bytes);
//! let by: i32 = r.get().unwrap();
//! let path: String = r.get().unwrap();
//! r.finish().unwrap();
//! assert_eq!((by, path.as_str()), (5, "/demo/counter"));
//! ```

mod de;
mod error;
mod ser;

pub use de::Deserializer;
pub use error::WireError;
pub use ser::Serializer;

use serde::{Deserialize, Serialize};

/// Encodes one value into a fresh buffer.
pub fn to_bytes<T: ?Sized + Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut writer = Writer::new();
    writer.put(value)?;
    Ok(writer.into_bytes())
}

/// Decodes one value that must span the whole buffer.
pub fn from_bytes<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, WireError> {
    let mut reader = Reader::new(bytes);
    let value = reader.get()?;
    reader.finish()?;
    Ok(value)
}

/// Growable output buffer that values are appended to in order.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the encoding of `value`.
    pub fn put<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), WireError> {
        value.serialize(&mut Serializer::new(&mut self.buf))
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor that consumes values in the order they were written.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    /// Decodes the next value.
    pub fn get<T: Deserialize<'a>>(&mut self) -> Result<T, WireError> {
        let mut de = Deserializer::new(self.input);
        let value = T::deserialize(&mut de)?;
        self.input = de.remaining();
        Ok(value)
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// Fails if any input is left over.
    pub fn finish(self) -> Result<(), WireError> {
        match self.input.len() {
            0 => Ok(()),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

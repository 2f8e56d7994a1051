//! Buffer-based encoding/decoding traits
//!
//! Every value that crosses a store connection implements [`Denc`], which
//! writes directly into a caller-provided `BufMut` and reads from any `Buf`.
//! All integers are little-endian. Variable-length values (byte strings,
//! strings, vectors) carry a `u32` length prefix.
//!
//! ```rust
//! use bytes::BytesMut;
//! use denc::Denc;
//!
//! let mut buf = BytesMut::new();
//! 42u32.encode(&mut buf).unwrap();
//! vec![1u16, 2, 3].encode(&mut buf).unwrap();
//!
//! let mut rd = buf.freeze();
//! assert_eq!(u32::decode(&mut rd).unwrap(), 42);
//! assert_eq!(Vec::<u16>::decode(&mut rd).unwrap(), vec![1, 2, 3]);
//! ```

use crate::error::DencError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encoding trait that writes directly to a mutable buffer
///
/// Types should implement `encoded_size()` to return `Some(size)` whenever
/// possible, as this enables exact preallocation in [`encode_to_bytes`].
pub trait Denc: Sized {
    /// Does this type use versioned encoding (a version header before the content)?
    const USES_VERSIONING: bool = false;

    /// Encode directly into a mutable buffer
    ///
    /// # Errors
    ///
    /// Returns `DencError` if encoding fails (e.g., insufficient buffer space)
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), DencError>;

    /// Decode from a buffer
    ///
    /// # Errors
    ///
    /// Returns `DencError` if decoding fails (e.g., unexpected EOF, invalid data)
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DencError>;

    /// Calculate encoded size, or `None` when it would require a full encode
    fn encoded_size(&self) -> Option<usize>;
}

/// Marker trait for types with compile-time known fixed size
pub trait FixedSize: Denc {
    /// The fixed size in bytes
    const SIZE: usize;
}

/// Encode a value into a freshly allocated buffer
pub fn encode_to_bytes<T: Denc>(value: &T) -> Result<Bytes, DencError> {
    let mut buf = BytesMut::with_capacity(value.encoded_size().unwrap_or(64));
    value.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Decode a value that must consume the whole buffer
pub fn decode_exact<T: Denc, B: Buf>(buf: &mut B) -> Result<T, DencError> {
    let value = T::decode(buf)?;
    if buf.has_remaining() {
        return Err(DencError::InvalidData(format!(
            "{} trailing bytes after value",
            buf.remaining()
        )));
    }
    Ok(value)
}

fn ensure_remaining<B: Buf>(buf: &B, what: &str, need: usize) -> Result<(), DencError> {
    if buf.remaining() < need {
        return Err(DencError::short_read(what, need, buf.remaining()));
    }
    Ok(())
}

fn decode_len<B: Buf>(buf: &mut B, what: &str) -> Result<usize, DencError> {
    let len = u32::decode(buf)? as usize;
    ensure_remaining(buf, what, len)?;
    Ok(len)
}

fn encode_len<B: BufMut>(len: usize, buf: &mut B) -> Result<(), DencError> {
    let len = u32::try_from(len)
        .map_err(|_| DencError::Denc(format!("Length {} does not fit in u32", len)))?;
    len.encode(buf)
}

// ============= Primitive Type Implementations =============

macro_rules! impl_denc_int {
    ($type:ty, $put_method:ident, $get_method:ident, $size:expr) => {
        impl Denc for $type {
            fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), DencError> {
                if buf.remaining_mut() < $size {
                    return Err(DencError::Protocol(format!(
                        "Insufficient buffer space: need {} bytes for {}, have {}",
                        $size,
                        stringify!($type),
                        buf.remaining_mut()
                    )));
                }
                buf.$put_method(*self);
                Ok(())
            }

            fn decode<B: Buf>(buf: &mut B) -> Result<Self, DencError> {
                ensure_remaining(buf, stringify!($type), $size)?;
                Ok(buf.$get_method())
            }

            fn encoded_size(&self) -> Option<usize> {
                Some($size)
            }
        }

        impl FixedSize for $type {
            const SIZE: usize = $size;
        }
    };
}

impl_denc_int!(u8, put_u8, get_u8, 1);
impl_denc_int!(u16, put_u16_le, get_u16_le, 2);
impl_denc_int!(u32, put_u32_le, get_u32_le, 4);
impl_denc_int!(u64, put_u64_le, get_u64_le, 8);
impl_denc_int!(i64, put_i64_le, get_i64_le, 8);

// bool is encoded as u8 (0 or 1); any other byte is rejected
impl Denc for bool {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), DencError> {
        u8::from(*self).encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DencError> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DencError::InvalidData(format!(
                "Invalid bool byte: {}",
                other
            ))),
        }
    }

    fn encoded_size(&self) -> Option<usize> {
        Some(1)
    }
}

impl FixedSize for bool {
    const SIZE: usize = 1;
}

// Fixed-size byte arrays are written raw, without a length prefix
impl<const N: usize> Denc for [u8; N] {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), DencError> {
        if buf.remaining_mut() < N {
            return Err(DencError::Protocol(format!(
                "Insufficient buffer space: need {} bytes for byte array, have {}",
                N,
                buf.remaining_mut()
            )));
        }
        buf.put_slice(self);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DencError> {
        ensure_remaining(buf, "byte array", N)?;
        let mut array = [0u8; N];
        buf.copy_to_slice(&mut array);
        Ok(array)
    }

    fn encoded_size(&self) -> Option<usize> {
        Some(N)
    }
}

impl<const N: usize> FixedSize for [u8; N] {
    const SIZE: usize = N;
}

// ============= Variable-length Types =============

/// Byte strings decode without copying when the source buffer is `Bytes`
impl Denc for Bytes {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), DencError> {
        encode_len(self.len(), buf)?;
        buf.put_slice(self);
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DencError> {
        let len = decode_len(buf, "byte string")?;
        Ok(buf.copy_to_bytes(len))
    }

    fn encoded_size(&self) -> Option<usize> {
        Some(4 + self.len())
    }
}

impl Denc for String {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), DencError> {
        encode_len(self.len(), buf)?;
        buf.put_slice(self.as_bytes());
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DencError> {
        let len = decode_len(buf, "string")?;
        let raw = buf.copy_to_bytes(len);
        String::from_utf8(raw.to_vec())
            .map_err(|e| DencError::InvalidData(format!("Invalid UTF-8 string: {}", e)))
    }

    fn encoded_size(&self) -> Option<usize> {
        Some(4 + self.len())
    }
}

impl<T: Denc> Denc for Vec<T> {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), DencError> {
        encode_len(self.len(), buf)?;
        for item in self {
            item.encode(buf)?;
        }
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DencError> {
        let count = u32::decode(buf)? as usize;
        // Each element takes at least one byte, so a count larger than the
        // remaining input is certainly corrupt; avoid a huge preallocation.
        if count > buf.remaining() {
            return Err(DencError::short_read("vector", count, buf.remaining()));
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }

    fn encoded_size(&self) -> Option<usize> {
        let mut total = 4;
        for item in self {
            total += item.encoded_size()?;
        }
        Some(total)
    }
}

/// Optional values carry a one-byte presence flag
impl<T: Denc> Denc for Option<T> {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), DencError> {
        match self {
            Some(value) => {
                true.encode(buf)?;
                value.encode(buf)
            }
            None => false.encode(buf),
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self, DencError> {
        if bool::decode(buf)? {
            Ok(Some(T::decode(buf)?))
        } else {
            Ok(None)
        }
    }

    fn encoded_size(&self) -> Option<usize> {
        match self {
            Some(value) => Some(1 + value.encoded_size()?),
            None => Some(1),
        }
    }
}

// ============= Versioned Encoding =============

/// Size of the header written by [`VersionedEncode::encode_versioned`]
pub const VERSION_HEADER_SIZE: usize = 6; // struct_v (1) + struct_compat (1) + len (4)

/// Trait for types that add version metadata during encoding
///
/// The content is prefixed by `struct_v`, `struct_compat` and the content
/// length, so a decoder can skip fields appended by newer encoders.
pub trait VersionedEncode: Sized {
    /// Get the current version to encode with
    fn encoding_version(&self) -> u8;

    /// Get the minimum version a decoder must understand
    fn compat_version(&self) -> u8;

    /// Highest version this build can decode
    const MAX_SUPPORTED_VERSION: u8;

    /// Encode the actual content (without version wrapper) into a buffer
    fn encode_content<B: BufMut>(&self, buf: &mut B, version: u8) -> Result<(), DencError>;

    /// Decode content for a specific version
    fn decode_content<B: Buf>(buf: &mut B, version: u8) -> Result<Self, DencError>;

    /// Size of the content without the version header
    fn encoded_size_content(&self, version: u8) -> Option<usize>;

    fn encoded_size_versioned(&self) -> Option<usize> {
        let version = self.encoding_version();
        Some(VERSION_HEADER_SIZE + self.encoded_size_content(version)?)
    }

    /// Encode with version metadata
    fn encode_versioned<B: BufMut>(&self, buf: &mut B) -> Result<(), DencError> {
        let version = self.encoding_version();
        let compat = self.compat_version();

        let mut content_buf = BytesMut::new();
        self.encode_content(&mut content_buf, version)?;

        buf.put_u8(version);
        buf.put_u8(compat);
        encode_len(content_buf.len(), buf)?;
        buf.put_slice(&content_buf);
        Ok(())
    }

    /// Decode with version handling
    fn decode_versioned<B: Buf>(buf: &mut B) -> Result<Self, DencError> {
        ensure_remaining(buf, "version header", VERSION_HEADER_SIZE)?;

        let struct_v = buf.get_u8();
        let struct_compat = buf.get_u8();
        let struct_len = buf.get_u32_le() as usize;

        if struct_compat > Self::MAX_SUPPORTED_VERSION {
            return Err(DencError::Denc(format!(
                "Encoding requires version {} but only {} is supported",
                struct_compat,
                Self::MAX_SUPPORTED_VERSION
            )));
        }
        ensure_remaining(buf, "versioned content", struct_len)?;

        let mut content = buf.copy_to_bytes(struct_len);
        let result = Self::decode_content(&mut content, struct_v)?;
        // Whatever is left in `content` belongs to a newer version and is skipped
        Ok(result)
    }
}

/// Implement `Denc` for a type that implements `VersionedEncode`
#[macro_export]
macro_rules! impl_denc_for_versioned {
    ($type:ty) => {
        impl $crate::denc::Denc for $type {
            const USES_VERSIONING: bool = true;

            fn encode<B: bytes::BufMut>(
                &self,
                buf: &mut B,
            ) -> std::result::Result<(), $crate::error::DencError> {
                <Self as $crate::denc::VersionedEncode>::encode_versioned(self, buf)
            }

            fn decode<B: bytes::Buf>(
                buf: &mut B,
            ) -> std::result::Result<Self, $crate::error::DencError> {
                <Self as $crate::denc::VersionedEncode>::decode_versioned(buf)
            }

            fn encoded_size(&self) -> Option<usize> {
                <Self as $crate::denc::VersionedEncode>::encoded_size_versioned(self)
            }
        }
    };
}

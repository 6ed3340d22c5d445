//! Binary buffers: `ArrayBuffer` and the fixed-width typed arrays.

use crate::error::{Error, Result};
use crate::wire::SpecialKind;

/// The concrete type of a binary buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    ArrayBuffer,
    Uint8Array,
    Uint16Array,
    Uint32Array,
    Int8Array,
    Int16Array,
    Int32Array,
}

impl BufferKind {
    /// Size in bytes of one element.
    pub fn element_width(self) -> usize {
        match self {
            BufferKind::ArrayBuffer | BufferKind::Uint8Array | BufferKind::Int8Array => 1,
            BufferKind::Uint16Array | BufferKind::Int16Array => 2,
            BufferKind::Uint32Array | BufferKind::Int32Array => 4,
        }
    }

    pub fn special_kind(self) -> SpecialKind {
        match self {
            BufferKind::ArrayBuffer => SpecialKind::ArrayBuffer,
            BufferKind::Uint8Array => SpecialKind::Uint8Array,
            BufferKind::Uint16Array => SpecialKind::Uint16Array,
            BufferKind::Uint32Array => SpecialKind::Uint32Array,
            BufferKind::Int8Array => SpecialKind::Int8Array,
            BufferKind::Int16Array => SpecialKind::Int16Array,
            BufferKind::Int32Array => SpecialKind::Int32Array,
        }
    }

    /// The buffer kind for a special kind, if it is a binary one.
    pub fn from_special(kind: SpecialKind) -> Option<Self> {
        Some(match kind {
            SpecialKind::ArrayBuffer => BufferKind::ArrayBuffer,
            SpecialKind::Uint8Array => BufferKind::Uint8Array,
            SpecialKind::Uint16Array => BufferKind::Uint16Array,
            SpecialKind::Uint32Array => BufferKind::Uint32Array,
            SpecialKind::Int8Array => BufferKind::Int8Array,
            SpecialKind::Int16Array => BufferKind::Int16Array,
            SpecialKind::Int32Array => BufferKind::Int32Array,
            _ => return None,
        })
    }
}

/// An element type a typed buffer can be viewed as.
pub trait Element: Copy {
    const KIND: BufferKind;

    fn read(bytes: &[u8]) -> Self;
    fn write(self, out: &mut Vec<u8>);
}

macro_rules! element {
    ($ty:ty, $kind:ident) => {
        impl Element for $ty {
            const KIND: BufferKind = BufferKind::$kind;

            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            fn write(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
        }
    };
}

element!(u8, Uint8Array);
element!(i8, Int8Array);
element!(u16, Uint16Array);
element!(i16, Int16Array);
element!(u32, Uint32Array);
element!(i32, Int32Array);

/// Raw bytes plus the concrete buffer type they were created as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    kind: BufferKind,
    bytes: Vec<u8>,
}

impl Buffer {
    /// Wrap raw bytes as the given kind.
    ///
    /// Fails when the byte length is not a whole number of elements.
    pub fn new(kind: BufferKind, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() % kind.element_width() != 0 {
            return Err(Error::corrupt(format!(
                "{:?} byte length {} is not a multiple of {}",
                kind,
                bytes.len(),
                kind.element_width()
            )));
        }
        Ok(Self { kind, bytes })
    }

    pub fn array_buffer(bytes: Vec<u8>) -> Self {
        Self {
            kind: BufferKind::ArrayBuffer,
            bytes,
        }
    }

    /// Build a typed array from elements (little-endian layout).
    pub fn from_elements<T: Element>(elements: &[T]) -> Self {
        let mut bytes = Vec::with_capacity(elements.len() * T::KIND.element_width());
        for e in elements {
            e.write(&mut bytes);
        }
        Self {
            kind: T::KIND,
            bytes,
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Number of elements at this buffer's element width.
    pub fn len(&self) -> usize {
        self.bytes.len() / self.kind.element_width()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// View the bytes as elements of `T`; `None` if `T` is not this kind.
    pub fn elements<T: Element>(&self) -> Option<Vec<T>> {
        if T::KIND != self.kind {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(self.kind.element_width())
                .map(T::read)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_widths() {
        assert_eq!(BufferKind::ArrayBuffer.element_width(), 1);
        assert_eq!(BufferKind::Int16Array.element_width(), 2);
        assert_eq!(BufferKind::Uint32Array.element_width(), 4);
    }

    #[test]
    fn typed_elements_roundtrip_through_bytes() {
        let buffer = Buffer::from_elements(&[1u16, 0x0203]);
        assert_eq!(buffer.kind(), BufferKind::Uint16Array);
        assert_eq!(buffer.bytes(), &[1, 0, 3, 2]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.elements::<u16>(), Some(vec![1, 0x0203]));
        assert_eq!(buffer.elements::<i16>(), None);
    }

    #[test]
    fn negative_elements() {
        let buffer = Buffer::from_elements(&[-1i32, 5]);
        assert_eq!(buffer.elements::<i32>(), Some(vec![-1, 5]));
    }

    #[test]
    fn rejects_partial_elements() {
        assert!(Buffer::new(BufferKind::Int32Array, vec![0; 6]).is_err());
        assert!(Buffer::new(BufferKind::Int32Array, vec![0; 8]).is_ok());
    }

    #[test]
    fn special_kind_mapping() {
        for kind in [
            BufferKind::ArrayBuffer,
            BufferKind::Uint8Array,
            BufferKind::Uint16Array,
            BufferKind::Uint32Array,
            BufferKind::Int8Array,
            BufferKind::Int16Array,
            BufferKind::Int32Array,
        ] {
            assert_eq!(BufferKind::from_special(kind.special_kind()), Some(kind));
        }
        assert_eq!(BufferKind::from_special(SpecialKind::Date), None);
    }
}

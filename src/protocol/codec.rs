//! Wire-level building blocks: payload scanning and frame assembly.
//!
//! Every message is framed as a one-byte tag (absent only on the startup
//! family), a four-byte length that counts itself plus the payload, and
//! the payload proper. Integers are network order throughout, so the
//! scanners here decode big-endian and hand back the unconsumed tail,
//! letting parsers chain them without tracking offsets.

use zerocopy::FromBytes;
use zerocopy::byteorder::big_endian::{I16, I32, U16, U32};

use crate::error::{Error, Result};

fn short_input(what: &str, want: usize, have: usize) -> Error {
    Error::Protocol(format!("{what}: payload truncated ({have} of {want} bytes)"))
}

/// Split one byte off the front of `data`.
#[inline]
pub fn take_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((&byte, tail)) => Ok((byte, tail)),
        None => Err(short_input("take_u8", 1, 0)),
    }
}

macro_rules! take_be {
    ($name:ident, $int:ty, $repr:ty) => {
        #[doc = concat!("Split a big-endian `", stringify!($int), "` off the front of `data`.")]
        #[inline]
        pub fn $name(data: &[u8]) -> Result<($int, &[u8])> {
            const WIDTH: usize = std::mem::size_of::<$int>();
            if data.len() < WIDTH {
                return Err(short_input(stringify!($name), WIDTH, data.len()));
            }
            let (head, tail) = data.split_at(WIDTH);
            let value = <$repr>::ref_from_bytes(head)
                .map_err(|e| Error::Protocol(format!("{}: {e:?}", stringify!($name))))?;
            Ok((value.get(), tail))
        }
    };
}

take_be!(take_i16, i16, I16);
take_be!(take_u16, u16, U16);
take_be!(take_i32, i32, I32);
take_be!(take_u32, u32, U32);

/// Split a NUL-terminated byte string off the front of `data`.
///
/// The terminator is consumed but not included in the returned slice.
#[inline]
pub fn take_cstring(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let Some(nul) = memchr::memchr(0, data) else {
        return Err(Error::Protocol(
            "string field is missing its NUL terminator".into(),
        ));
    };
    Ok((&data[..nul], &data[nul + 1..]))
}

/// Like [`take_cstring`], additionally validating the contents as UTF-8.
#[inline]
pub fn take_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    let (raw, tail) = take_cstring(data)?;
    let text = simdutf8::compat::from_utf8(raw)
        .map_err(|e| Error::Protocol(format!("string field is not UTF-8: {e}")))?;
    Ok((text, tail))
}

/// Assembles one frontend frame, back-patching the length on [`seal`].
///
/// The length field counts itself and the payload; the tag byte stays
/// outside the count. Several frames are typically assembled into the same
/// buffer and flushed as a single socket write.
///
/// [`seal`]: FrameWriter::seal
pub struct FrameWriter<'a> {
    buf: &'a mut Vec<u8>,
    len_at: usize,
}

impl<'a> FrameWriter<'a> {
    /// Open a frame with the given tag byte.
    pub fn tagged(buf: &'a mut Vec<u8>, tag: u8) -> Self {
        buf.push(tag);
        Self::untagged(buf)
    }

    /// Open a tagless frame (startup family only).
    pub fn untagged(buf: &'a mut Vec<u8>) -> Self {
        let len_at = buf.len();
        buf.extend_from_slice(&[0; 4]); // patched by seal()
        Self { buf, len_at }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Append `text` with a trailing NUL.
    pub fn put_cstr(&mut self, text: &str) {
        self.buf.extend_from_slice(text.as_bytes());
        self.buf.push(0);
    }

    /// Patch the length field and finish the frame.
    pub fn seal(self) {
        let frame_len = (self.buf.len() - self.len_at) as i32;
        self.buf[self.len_at..self.len_at + 4].copy_from_slice(&frame_len.to_be_bytes());
    }
}

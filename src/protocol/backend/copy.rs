//! COPY protocol backend messages.

use crate::error::Result;
use crate::protocol::codec::{take_u16, take_u8};

/// CopyInResponse message - server is ready to receive COPY data.
#[derive(Debug, Clone)]
pub struct CopyInResponse {
    /// Overall format (0=text, 1=binary)
    pub format: u8,
    /// Per-column format codes
    pub column_formats: Vec<u16>,
}

impl CopyInResponse {
    /// Parse a CopyInResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (format, column_formats) = parse_copy_response(payload)?;
        Ok(Self {
            format,
            column_formats,
        })
    }
}

/// CopyOutResponse message - server is about to send COPY data.
#[derive(Debug, Clone)]
pub struct CopyOutResponse {
    /// Overall format (0=text, 1=binary)
    pub format: u8,
    /// Per-column format codes
    pub column_formats: Vec<u16>,
}

impl CopyOutResponse {
    /// Parse a CopyOutResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (format, column_formats) = parse_copy_response(payload)?;
        Ok(Self {
            format,
            column_formats,
        })
    }
}

fn parse_copy_response(payload: &[u8]) -> Result<(u8, Vec<u16>)> {
    let (format, rest) = take_u8(payload)?;

    let (num_columns, mut rest) = take_u16(rest)?;
    let mut column_formats = Vec::with_capacity(num_columns as usize);

    for _ in 0..num_columns {
        let (fmt, remaining) = take_u16(rest)?;
        column_formats.push(fmt);
        rest = remaining;
    }

    Ok((format, column_formats))
}

/// CopyData message - COPY data (used in both directions).
#[derive(Debug, Clone, Copy)]
pub struct CopyData<'a> {
    /// Raw data bytes
    pub data: &'a [u8],
}

impl<'a> CopyData<'a> {
    /// Parse a CopyData message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        Ok(Self { data: payload })
    }
}

/// CopyDone message - COPY operation completed.
#[derive(Debug, Clone, Copy)]
pub struct CopyDone;

impl CopyDone {
    /// Parse a CopyDone message from payload bytes.
    pub fn parse(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_copy_in_response() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&2_u16.to_be_bytes());
        payload.extend_from_slice(&0_u16.to_be_bytes());
        payload.extend_from_slice(&0_u16.to_be_bytes());

        let resp = CopyInResponse::parse(&payload).unwrap();
        assert_eq!(resp.format, 0);
        assert_eq!(resp.column_formats, vec![0, 0]);
    }

    #[test]
    fn parse_copy_data() {
        let data = CopyData::parse(b"a\tb\n").unwrap();
        assert_eq!(data.data, b"a\tb\n");
    }
}

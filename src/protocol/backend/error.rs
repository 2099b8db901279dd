//! Error and notice response messages.

use crate::error::{Error, Result, ServerError};
use crate::protocol::codec::take_cstr;

/// Parse error/notice fields from payload into a ServerError.
fn parse_fields(payload: &[u8]) -> Result<ServerError> {
    let mut pairs = Vec::new();
    let mut data = payload;

    while !data.is_empty() && data[0] != 0 {
        let field_type = data[0];
        data = &data[1..];

        let (value, rest) = take_cstr(data)?;
        data = rest;

        pairs.push((field_type, value));
    }

    Ok(ServerError::from_fields(pairs.into_iter()))
}

/// ErrorResponse message - error from server.
#[derive(Debug, Clone)]
pub struct ErrorResponse(pub ServerError);

impl ErrorResponse {
    /// Parse an ErrorResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self(parse_fields(payload)?))
    }

    /// Convert to an Error, distinguishing integrity violations.
    pub fn into_error(self) -> Error {
        Error::from_server(self.0)
    }
}

/// NoticeResponse message - non-fatal warning/info from server.
#[derive(Debug, Clone)]
pub struct NoticeResponse(pub ServerError);

impl NoticeResponse {
    /// Parse a NoticeResponse message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        Ok(Self(parse_fields(payload)?))
    }
}

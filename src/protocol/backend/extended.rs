//! Extended query protocol backend messages.

use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::take_u32;
use crate::protocol::types::Oid;
use zerocopy::byteorder::big_endian::U16 as U16BE;

/// ParseComplete message - statement parsing completed.
#[derive(Debug, Clone, Copy)]
pub struct ParseComplete;

impl ParseComplete {
    /// Parse a ParseComplete message from payload bytes.
    pub fn parse(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// BindComplete message - parameter binding completed.
#[derive(Debug, Clone, Copy)]
pub struct BindComplete;

impl BindComplete {
    /// Parse a BindComplete message from payload bytes.
    pub fn parse(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// CloseComplete message - statement/portal close completed.
#[derive(Debug, Clone, Copy)]
pub struct CloseComplete;

impl CloseComplete {
    /// Parse a CloseComplete message from payload bytes.
    pub fn parse(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// NoData message - query returns no data.
#[derive(Debug, Clone, Copy)]
pub struct NoData;

impl NoData {
    /// Parse a NoData message from payload bytes.
    pub fn parse(_payload: &[u8]) -> Result<Self> {
        Ok(Self)
    }
}

/// ParameterDescription message header.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct ParameterDescriptionHead {
    num_params: U16BE,
}

/// ParameterDescription message - describes parameters for a prepared statement.
#[derive(Debug, Clone)]
pub struct ParameterDescription {
    param_oids: Vec<Oid>,
}

impl ParameterDescription {
    /// Parse a ParameterDescription message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 {
            return Err(Error::Protocol("ParameterDescription: short payload".into()));
        }
        let head = ParameterDescriptionHead::ref_from_bytes(&payload[..2])
            .map_err(|e| Error::Protocol(format!("ParameterDescription header: {e:?}")))?;

        let num_params = head.num_params.get() as usize;
        let mut param_oids = Vec::with_capacity(num_params);
        let mut data = &payload[2..];

        for _ in 0..num_params {
            let (oid, rest) = take_u32(data)?;
            param_oids.push(oid);
            data = rest;
        }

        Ok(Self { param_oids })
    }

    /// Get the number of parameters.
    pub fn len(&self) -> usize {
        self.param_oids.len()
    }

    /// Check if there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.param_oids.is_empty()
    }

    /// Get parameter type OIDs.
    pub fn oids(&self) -> &[Oid] {
        &self.param_oids
    }

    /// Take ownership of the parameter type OIDs.
    pub fn into_oids(self) -> Vec<Oid> {
        self.param_oids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_parameter_description() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2_u16.to_be_bytes());
        payload.extend_from_slice(&23_u32.to_be_bytes());
        payload.extend_from_slice(&25_u32.to_be_bytes());

        let desc = ParameterDescription::parse(&payload).unwrap();
        assert_eq!(desc.oids(), &[23, 25]);
    }

    #[test]
    fn parse_empty_parameter_description() {
        let payload = 0_u16.to_be_bytes();
        let desc = ParameterDescription::parse(&payload).unwrap();
        assert!(desc.is_empty());
    }
}

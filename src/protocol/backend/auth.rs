//! Startup and authentication backend messages.

use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::protocol::codec::{take_cstr, take_i32};
use crate::protocol::types::TransactionStatus;
use zerocopy::byteorder::big_endian::U32 as U32BE;

/// Authentication method constants.
pub mod auth_type {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
}

/// Authentication message from the server.
#[derive(Debug)]
pub enum AuthenticationMessage {
    /// Authentication successful
    Ok,
    /// Cleartext password required
    CleartextPassword,
    /// MD5 password required (with 4-byte salt)
    Md5Password { salt: [u8; 4] },
    /// Any other authentication method; carries the raw request code
    Unsupported(i32),
}

impl AuthenticationMessage {
    /// Parse an Authentication message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (auth_type, rest) = take_i32(payload)?;

        match auth_type {
            auth_type::OK => Ok(AuthenticationMessage::Ok),
            auth_type::CLEARTEXT_PASSWORD => Ok(AuthenticationMessage::CleartextPassword),
            auth_type::MD5_PASSWORD => {
                if rest.len() < 4 {
                    return Err(Error::Protocol("MD5Password: missing salt".into()));
                }
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&rest[..4]);
                Ok(AuthenticationMessage::Md5Password { salt })
            }
            other => Ok(AuthenticationMessage::Unsupported(other)),
        }
    }
}

/// BackendKeyData message - contains process ID and secret key for cancellation.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct BackendKeyData {
    /// Process ID of the backend
    pub pid: U32BE,
    /// Secret key for cancellation
    pub secret_key: U32BE,
}

impl BackendKeyData {
    /// Parse a BackendKeyData message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<&Self> {
        Self::ref_from_bytes(payload).map_err(|e| Error::Protocol(format!("BackendKeyData: {e:?}")))
    }

    /// Get the process ID.
    pub fn process_id(&self) -> u32 {
        self.pid.get()
    }

    /// Get the secret key.
    pub fn secret(&self) -> u32 {
        self.secret_key.get()
    }
}

/// ParameterStatus message - server parameter name and value.
#[derive(Debug, Clone)]
pub struct ParameterStatus<'a> {
    /// Parameter name
    pub name: &'a str,
    /// Parameter value
    pub value: &'a str,
}

impl<'a> ParameterStatus<'a> {
    /// Parse a ParameterStatus message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (name, rest) = take_cstr(payload)?;
        let (value, _) = take_cstr(rest)?;
        Ok(Self { name, value })
    }
}

/// ReadyForQuery message - indicates server is ready for a new query.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct ReadyForQuery {
    /// Transaction status byte
    pub status: u8,
}

impl ReadyForQuery {
    /// Parse a ReadyForQuery message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<&Self> {
        Self::ref_from_bytes(payload).map_err(|e| Error::Protocol(format!("ReadyForQuery: {e:?}")))
    }

    /// Get the transaction status.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        TransactionStatus::from_byte(self.status)
    }
}

//! Record-level wire types shared by the record layer and the handshake.

use std::fmt;

use nom::number::complete::{be_u16, be_u8};
use nom::IResult;

use crate::buffer::Buf;
use crate::Error;

/// Largest sequence number of an epoch (2^48 - 1).
pub const MAX_SEQUENCE_NUMBER: u64 = (1 << 48) - 1;

/// Largest plaintext fragment a record may carry (2^14).
pub const MAX_PLAINTEXT_FRAGMENT_LENGTH: usize = 16_384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
    /// Record protected with a connection id (RFC 9146).
    Tls12Cid,
    Unknown(u8),
    #[default]
    Invalid,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            20 => ContentType::ChangeCipherSpec,
            21 => ContentType::Alert,
            22 => ContentType::Handshake,
            23 => ContentType::ApplicationData,
            25 => ContentType::Tls12Cid,
            0 => ContentType::Invalid,
            _ => ContentType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            ContentType::ChangeCipherSpec => 20,
            ContentType::Alert => 21,
            ContentType::Handshake => 22,
            ContentType::ApplicationData => 23,
            ContentType::Tls12Cid => 25,
            ContentType::Unknown(value) => *value,
            ContentType::Invalid => 0,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ContentType> {
        let (input, byte) = be_u8(input)?;
        Ok((input, Self::from_u8(byte)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    DTLS1_0,
    #[default]
    DTLS1_2,
    Unknown(u16),
}

impl ProtocolVersion {
    pub fn as_u16(&self) -> u16 {
        match self {
            ProtocolVersion::DTLS1_0 => 0xFEFF,
            ProtocolVersion::DTLS1_2 => 0xFEFD,
            ProtocolVersion::Unknown(value) => *value,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            0xFEFF => ProtocolVersion::DTLS1_0,
            0xFEFD => ProtocolVersion::DTLS1_2,
            _ => ProtocolVersion::Unknown(value),
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ProtocolVersion> {
        let (input, version) = be_u16(input)?;
        Ok((input, Self::from_u16(version)))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.extend_from_slice(&self.as_u16().to_be_bytes());
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::DTLS1_0 => write!(f, "DTLS 1.0"),
            ProtocolVersion::DTLS1_2 => write!(f, "DTLS 1.2"),
            ProtocolVersion::Unknown(v) => write!(f, "Unknown({:04x})", v),
        }
    }
}

/// Epoch and sequence number of a record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Sequence {
    pub epoch: u16,
    pub sequence_number: u64, // u48
}

impl Sequence {
    pub fn new(epoch: u16) -> Self {
        Self {
            epoch,
            sequence_number: 0,
        }
    }

    /// The 8 byte form used in nonces and additional data.
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut out = [0; 8];
        out[..2].copy_from_slice(&self.epoch.to_be_bytes());
        out[2..].copy_from_slice(&self.sequence_number.to_be_bytes()[2..]);
        out
    }

    /// Increase the epoch by one and error if it wraps.
    pub fn next_epoch(epoch: u16) -> Result<u16, Error> {
        // https://datatracker.ietf.org/doc/html/rfc6347#section-4.1
        //
        // Implementations MUST NOT allow the epoch to wrap, but
        // instead MUST establish a new association.
        epoch.checked_add(1).ok_or(Error::EpochExhausted)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[epoch: {}, sequence_number: {}]", self.epoch, self.sequence_number)
    }
}

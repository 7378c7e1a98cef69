use nom::error::{Error, ErrorKind};
use nom::{Err, IResult};

use super::id::Cookie;
use crate::buffer::Buf;
use crate::types::ProtocolVersion;

/// Largest cookie a HELLO_VERIFY_REQUEST may carry (RFC 6347 4.2.1).
pub const MAX_HVR_COOKIE_LEN: usize = 32;

/// Stateless challenge answering a CLIENT_HELLO without a valid cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloVerifyRequest {
    pub server_version: ProtocolVersion,
    pub cookie: Cookie,
}

impl HelloVerifyRequest {
    /// Request for `cookie`.
    ///
    /// Sent as DTLS 1.0 regardless of the negotiated version, since the
    /// version is not known before the cookie round trip.
    pub fn new(cookie: Cookie) -> Self {
        HelloVerifyRequest {
            server_version: ProtocolVersion::DTLS1_0,
            cookie,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], HelloVerifyRequest> {
        let (rest, server_version) = ProtocolVersion::parse(input)?;
        if matches!(server_version, ProtocolVersion::Unknown(_)) {
            return Err(Err::Failure(Error::new(input, ErrorKind::Tag)));
        }
        let (rest, cookie) = Cookie::parse(rest)?;
        if !(1..=MAX_HVR_COOKIE_LEN).contains(&cookie.len()) {
            return Err(Err::Failure(Error::new(rest, ErrorKind::LengthValue)));
        }
        Ok((
            rest,
            HelloVerifyRequest {
                server_version,
                cookie,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        self.cookie.serialize(output);
    }
}

//! PSK and ECDHE_PSK key exchange messages (RFC 4279, RFC 5489).

use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};

use crate::buffer::Buf;
use crate::crypto::KeyExchangeAlgorithm;

const CURVE_TYPE_NAMED_CURVE: u8 = 3;
const NAMED_GROUP_X25519: u16 = 29;
const X25519_KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyExchange {
    pub identity_hint: Vec<u8>,
    pub ecdh_public: Option<[u8; 32]>,
}

impl ServerKeyExchange {
    pub fn parse(input: &[u8], algo: KeyExchangeAlgorithm) -> IResult<&[u8], ServerKeyExchange> {
        let (input, hint_len) = be_u16(input)?;
        let (input, hint) = take(hint_len)(input)?;
        let (input, ecdh_public) = match algo {
            KeyExchangeAlgorithm::Psk => (input, None),
            KeyExchangeAlgorithm::EcdhePsk => {
                let (input, curve_type) = be_u8(input)?;
                let (input, group) = be_u16(input)?;
                if curve_type != CURVE_TYPE_NAMED_CURVE || group != NAMED_GROUP_X25519 {
                    return Err(Err::Failure(Error::new(input, ErrorKind::Verify)));
                }
                let (input, public) = parse_public(input)?;
                (input, Some(public))
            }
        };
        Ok((
            input,
            ServerKeyExchange {
                identity_hint: hint.to_vec(),
                ecdh_public,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push_u16(self.identity_hint.len() as u16);
        output.extend_from_slice(&self.identity_hint);
        if let Some(public) = &self.ecdh_public {
            output.push(CURVE_TYPE_NAMED_CURVE);
            output.push_u16(NAMED_GROUP_X25519);
            output.push(public.len() as u8);
            output.extend_from_slice(public);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKeyExchange {
    pub identity: Vec<u8>,
    pub ecdh_public: Option<[u8; 32]>,
}

impl ClientKeyExchange {
    pub fn parse(input: &[u8], algo: KeyExchangeAlgorithm) -> IResult<&[u8], ClientKeyExchange> {
        let (input, identity_len) = be_u16(input)?;
        let (input, identity) = take(identity_len)(input)?;
        let (input, ecdh_public) = match algo {
            KeyExchangeAlgorithm::Psk => (input, None),
            KeyExchangeAlgorithm::EcdhePsk => {
                let (input, public) = parse_public(input)?;
                (input, Some(public))
            }
        };
        Ok((
            input,
            ClientKeyExchange {
                identity: identity.to_vec(),
                ecdh_public,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push_u16(self.identity.len() as u16);
        output.extend_from_slice(&self.identity);
        if let Some(public) = &self.ecdh_public {
            output.push(public.len() as u8);
            output.extend_from_slice(public);
        }
    }
}

fn parse_public(input: &[u8]) -> IResult<&[u8], [u8; 32]> {
    let (input, len) = be_u8(input)?;
    if len as usize != X25519_KEY_LEN {
        return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
    }
    let (input, data) = take(len)(input)?;
    let mut public = [0u8; 32];
    public.copy_from_slice(data);
    Ok((input, public))
}

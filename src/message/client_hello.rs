use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};
use tinyvec::TinyVec;

use super::{Cookie, Extensions, Random, SessionId};
use crate::buffer::Buf;
use crate::crypto::CipherSuite;
use crate::types::ProtocolVersion;
use crate::util::many0;

pub type CipherSuiteVec = TinyVec<[CipherSuite; 4]>;

/// The only compression method, "null".
pub const COMPRESSION_NULL: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub client_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cookie: Cookie,
    pub cipher_suites: CipherSuiteVec,
    pub compression_methods: Vec<u8>,
    pub extensions: Extensions,
}

impl ClientHello {
    pub fn new(
        random: Random,
        session_id: SessionId,
        cipher_suites: &[CipherSuite],
        extensions: Extensions,
    ) -> Self {
        ClientHello {
            client_version: ProtocolVersion::DTLS1_2,
            random,
            session_id,
            cookie: Cookie::empty(),
            cipher_suites: cipher_suites.iter().copied().collect(),
            compression_methods: vec![COMPRESSION_NULL],
            extensions,
        }
    }

    pub fn has_session_id(&self) -> bool {
        !self.session_id.is_empty()
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ClientHello> {
        let (input, client_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cookie) = Cookie::parse(input)?;
        let (input, cipher_suites_len) = be_u16(input)?;
        let (input, input_cipher) = take(cipher_suites_len)(input)?;
        let (rest, cipher_suites) = many0(CipherSuite::parse)(input_cipher)?;
        if !rest.is_empty() || cipher_suites.is_empty() {
            return Err(Err::Failure(Error::new(rest, ErrorKind::LengthValue)));
        }
        let (input, compression_methods_len) = be_u8(input)?;
        let (input, compression_methods) = take(compression_methods_len)(input)?;
        if !compression_methods.contains(&COMPRESSION_NULL) {
            return Err(Err::Failure(Error::new(input, ErrorKind::Verify)));
        }
        let (input, extensions) = Extensions::parse(input)?;

        Ok((
            input,
            ClientHello {
                client_version,
                random,
                session_id,
                cookie,
                cipher_suites,
                compression_methods: compression_methods.to_vec(),
                extensions,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.client_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        self.cookie.serialize(output);
        output.push_u16((self.cipher_suites.len() * 2) as u16);
        for suite in &self.cipher_suites {
            output.push_u16(suite.as_u16());
        }
        output.push(self.compression_methods.len() as u8);
        output.extend_from_slice(&self.compression_methods);
        self.extensions.serialize(output);
    }

    /// Serialize everything a cookie is bound to, i.e. the message without its cookie.
    pub fn serialize_for_cookie(&self, output: &mut Buf) {
        let mut copy = self.clone();
        copy.cookie = Cookie::empty();
        copy.serialize(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> ClientHello {
        ClientHello::new(
            Random::new(),
            SessionId::try_new(&[9; 8]).unwrap(),
            &[
                CipherSuite::EcdhePskAes128GcmSha256,
                CipherSuite::PskAes128GcmSha256,
            ],
            Extensions {
                server_name: Some("coap.local".into()),
                connection_id: None,
            },
        )
    }

    #[test]
    fn roundtrip() {
        let mut ch = hello();
        ch.cookie = Cookie::try_new(&[1, 2, 3, 4]).unwrap();

        let mut out = Buf::new();
        ch.serialize(&mut out);

        let (rest, parsed) = ClientHello::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, ch);
    }

    #[test]
    fn keeps_unknown_suites() {
        let mut ch = hello();
        ch.cipher_suites.push(CipherSuite::Unknown(0xC02B));

        let mut out = Buf::new();
        ch.serialize(&mut out);
        let (_, parsed) = ClientHello::parse(&out).unwrap();
        assert_eq!(parsed.cipher_suites.len(), 3);
    }

    #[test]
    fn cookie_binding_ignores_cookie() {
        let mut a = hello();
        let b = a.clone();
        a.cookie = Cookie::try_new(&[7; 16]).unwrap();

        let mut out_a = Buf::new();
        let mut out_b = Buf::new();
        a.serialize_for_cookie(&mut out_a);
        b.serialize_for_cookie(&mut out_b);
        assert_eq!(out_a, out_b);
    }

    #[test]
    fn rejects_missing_null_compression() {
        let mut ch = hello();
        ch.compression_methods = vec![1];
        let mut out = Buf::new();
        ch.serialize(&mut out);
        assert!(ClientHello::parse(&out).is_err());
    }
}

use nom::error::{Error, ErrorKind};
use nom::number::complete::be_u8;
use nom::{Err, IResult};

use super::client_hello::COMPRESSION_NULL;
use super::{Extensions, Random, SessionId};
use crate::buffer::Buf;
use crate::crypto::CipherSuite;
use crate::types::ProtocolVersion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub server_version: ProtocolVersion,
    pub random: Random,
    pub session_id: SessionId,
    pub cipher_suite: CipherSuite,
    pub compression_method: u8,
    pub extensions: Extensions,
}

impl ServerHello {
    pub fn new(
        random: Random,
        session_id: SessionId,
        cipher_suite: CipherSuite,
        extensions: Extensions,
    ) -> Self {
        ServerHello {
            server_version: ProtocolVersion::DTLS1_2,
            random,
            session_id,
            cipher_suite,
            compression_method: COMPRESSION_NULL,
            extensions,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], ServerHello> {
        let (input, server_version) = ProtocolVersion::parse(input)?;
        let (input, random) = Random::parse(input)?;
        let (input, session_id) = SessionId::parse(input)?;
        let (input, cipher_suite) = CipherSuite::parse(input)?;
        let (input, compression_method) = be_u8(input)?;
        if compression_method != COMPRESSION_NULL {
            return Err(Err::Failure(Error::new(input, ErrorKind::Verify)));
        }
        let (input, extensions) = Extensions::parse(input)?;

        Ok((
            input,
            ServerHello {
                server_version,
                random,
                session_id,
                cipher_suite,
                compression_method,
                extensions,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        self.server_version.serialize(output);
        self.random.serialize(output);
        self.session_id.serialize(output);
        output.push_u16(self.cipher_suite.as_u16());
        output.push(self.compression_method);
        self.extensions.serialize(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ConnectionId;

    #[test]
    fn roundtrip() {
        let sh = ServerHello::new(
            Random::new(),
            SessionId::try_new(&[1; 32]).unwrap(),
            CipherSuite::PskAes128GcmSha256,
            Extensions {
                server_name: None,
                connection_id: Some(ConnectionId::try_new(&[5; 4]).unwrap()),
            },
        );
        let mut out = Buf::new();
        sh.serialize(&mut out);
        let (rest, parsed) = ServerHello::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, sh);
    }
}

use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::be_u8;
use nom::Err;
use nom::{
    number::complete::{be_u16, be_u24},
    IResult,
};

use super::{
    ClientHello, ClientKeyExchange, Finished, HelloVerifyRequest, ServerHello, ServerKeyExchange,
};
use crate::buffer::Buf;
use crate::crypto::KeyExchangeAlgorithm;

/// msg_type(1) + length(3) + message_seq(2) + fragment_offset(3) + fragment_length(3)
pub const HANDSHAKE_HEADER_LEN: usize = 12;

#[derive(Debug, PartialEq, Eq, Default, Clone, Copy)]
pub struct Header {
    pub msg_type: MessageType,
    pub length: u32,
    pub message_seq: u16,
    pub fragment_offset: u32,
    pub fragment_length: u32,
}

impl Header {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Header> {
        let (input, msg_type) = MessageType::parse(input)?;
        let (input, length) = be_u24(input)?;
        let (input, message_seq) = be_u16(input)?;
        let (input, fragment_offset) = be_u24(input)?;
        let (input, fragment_length) = be_u24(input)?;

        Ok((
            input,
            Header {
                msg_type,
                length,
                message_seq,
                fragment_offset,
                fragment_length,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push(self.msg_type.as_u8());
        output.push_u24(self.length);
        output.push_u16(self.message_seq);
        output.push_u24(self.fragment_offset);
        output.push_u24(self.fragment_length);
    }

    pub fn is_fragment(&self) -> bool {
        self.fragment_offset > 0 || self.fragment_length < self.length
    }
}

/// One handshake fragment as it was found in a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFragment {
    pub header: Header,
    pub data: Vec<u8>,
}

impl HandshakeFragment {
    pub fn parse(input: &[u8]) -> IResult<&[u8], HandshakeFragment> {
        let (input, header) = Header::parse(input)?;
        if header.fragment_offset + header.fragment_length > header.length {
            return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
        }
        let (input, data) = take(header.fragment_length as usize)(input)?;
        Ok((
            input,
            HandshakeFragment {
                header,
                data: data.to_vec(),
            },
        ))
    }

    /// Parse every fragment in a handshake record.
    pub fn parse_all(mut input: &[u8]) -> Result<Vec<HandshakeFragment>, crate::Error> {
        let mut out = Vec::new();
        while !input.is_empty() {
            let (rest, fragment) = Self::parse(input)?;
            out.push(fragment);
            input = rest;
        }
        Ok(out)
    }
}

/// A complete (reassembled) handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub msg_type: MessageType,
    pub message_seq: u16,
    pub body: Vec<u8>,
}

impl Handshake {
    pub fn new(msg_type: MessageType, message_seq: u16, body: Vec<u8>) -> Self {
        Handshake {
            msg_type,
            message_seq,
            body,
        }
    }

    pub fn header(&self) -> Header {
        Header {
            msg_type: self.msg_type,
            length: self.body.len() as u32,
            message_seq: self.message_seq,
            fragment_offset: 0,
            fragment_length: self.body.len() as u32,
        }
    }

    /// Serialize as one unfragmented message, which is also the transcript form.
    pub fn serialize(&self, output: &mut Buf) {
        self.header().serialize(output);
        output.extend_from_slice(&self.body);
    }

    /// Split into fragments carrying at most `max` body bytes each.
    pub fn fragments(&self, max: usize) -> Vec<Buf> {
        let max = max.max(1);
        if self.body.len() <= max {
            let mut buf = Buf::with_capacity(HANDSHAKE_HEADER_LEN + self.body.len());
            self.serialize(&mut buf);
            return vec![buf];
        }

        self.body
            .chunks(max)
            .enumerate()
            .map(|(i, chunk)| {
                let header = Header {
                    fragment_offset: (i * max) as u32,
                    fragment_length: chunk.len() as u32,
                    ..self.header()
                };
                let mut buf = Buf::with_capacity(HANDSHAKE_HEADER_LEN + chunk.len());
                header.serialize(&mut buf);
                buf.extend_from_slice(chunk);
                buf
            })
            .collect()
    }

    /// Parse the body according to the message type.
    pub fn parse_body(&self, kx: Option<KeyExchangeAlgorithm>) -> Result<Body, crate::Error> {
        let (rest, body) = Body::parse(&self.body, self.msg_type, kx)?;
        if !rest.is_empty() {
            debug!("Trailing bytes after {:?}", self.msg_type);
            return Err(crate::Error::ParseError(ErrorKind::LengthValue));
        }
        Ok(body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    HelloRequest, // empty
    ClientHello,
    HelloVerifyRequest,
    ServerHello,
    ServerKeyExchange,
    ServerHelloDone, // empty
    ClientKeyExchange,
    Finished,
    Unknown(u8),
    #[default]
    Invalid,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => MessageType::HelloRequest,
            1 => MessageType::ClientHello,
            2 => MessageType::ServerHello,
            3 => MessageType::HelloVerifyRequest,
            12 => MessageType::ServerKeyExchange,
            14 => MessageType::ServerHelloDone,
            16 => MessageType::ClientKeyExchange,
            20 => MessageType::Finished,
            _ => MessageType::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            MessageType::HelloRequest => 0,
            MessageType::ClientHello => 1,
            MessageType::ServerHello => 2,
            MessageType::HelloVerifyRequest => 3,
            MessageType::ServerKeyExchange => 12,
            MessageType::ServerHelloDone => 14,
            MessageType::ClientKeyExchange => 16,
            MessageType::Finished => 20,
            MessageType::Unknown(value) => *value,
            MessageType::Invalid => 255,
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], MessageType> {
        let (input, byte) = be_u8(input)?;
        Ok((input, Self::from_u8(byte)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    HelloRequest,
    ClientHello(ClientHello),
    HelloVerifyRequest(HelloVerifyRequest),
    ServerHello(ServerHello),
    ServerKeyExchange(ServerKeyExchange),
    ServerHelloDone,
    ClientKeyExchange(ClientKeyExchange),
    Finished(Finished),
}

impl Body {
    pub fn parse(
        input: &[u8],
        m: MessageType,
        kx: Option<KeyExchangeAlgorithm>,
    ) -> IResult<&[u8], Body> {
        match m {
            MessageType::HelloRequest => Ok((input, Body::HelloRequest)),
            MessageType::ClientHello => {
                let (input, client_hello) = ClientHello::parse(input)?;
                Ok((input, Body::ClientHello(client_hello)))
            }
            MessageType::HelloVerifyRequest => {
                let (input, hello_verify_request) = HelloVerifyRequest::parse(input)?;
                Ok((input, Body::HelloVerifyRequest(hello_verify_request)))
            }
            MessageType::ServerHello => {
                let (input, server_hello) = ServerHello::parse(input)?;
                Ok((input, Body::ServerHello(server_hello)))
            }
            MessageType::ServerKeyExchange => {
                let kx = kx.ok_or_else(|| Err::Failure(Error::new(input, ErrorKind::Fail)))?;
                let (input, ske) = ServerKeyExchange::parse(input, kx)?;
                Ok((input, Body::ServerKeyExchange(ske)))
            }
            MessageType::ServerHelloDone => Ok((input, Body::ServerHelloDone)),
            MessageType::ClientKeyExchange => {
                let kx = kx.ok_or_else(|| Err::Failure(Error::new(input, ErrorKind::Fail)))?;
                let (input, cke) = ClientKeyExchange::parse(input, kx)?;
                Ok((input, Body::ClientKeyExchange(cke)))
            }
            MessageType::Finished => {
                let (input, finished) = Finished::parse(input)?;
                Ok((input, Body::Finished(finished)))
            }
            MessageType::Unknown(_) | MessageType::Invalid => {
                Err(Err::Failure(Error::new(input, ErrorKind::Switch)))
            }
        }
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Body::HelloRequest => MessageType::HelloRequest,
            Body::ClientHello(_) => MessageType::ClientHello,
            Body::HelloVerifyRequest(_) => MessageType::HelloVerifyRequest,
            Body::ServerHello(_) => MessageType::ServerHello,
            Body::ServerKeyExchange(_) => MessageType::ServerKeyExchange,
            Body::ServerHelloDone => MessageType::ServerHelloDone,
            Body::ClientKeyExchange(_) => MessageType::ClientKeyExchange,
            Body::Finished(_) => MessageType::Finished,
        }
    }

    pub fn serialize(&self, output: &mut Buf) {
        match self {
            Body::HelloRequest | Body::ServerHelloDone => {}
            Body::ClientHello(m) => m.serialize(output),
            Body::HelloVerifyRequest(m) => m.serialize(output),
            Body::ServerHello(m) => m.serialize(output),
            Body::ServerKeyExchange(m) => m.serialize(output),
            Body::ClientKeyExchange(m) => m.serialize(output),
            Body::Finished(m) => m.serialize(output),
        }
    }

    /// Wrap into a handshake message with the given sequence number.
    pub fn into_handshake(self, message_seq: u16) -> Handshake {
        let mut body = Buf::new();
        self.serialize(&mut body);
        Handshake::new(self.msg_type(), message_seq, body.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header {
            msg_type: MessageType::ClientHello,
            length: 300,
            message_seq: 2,
            fragment_offset: 100,
            fragment_length: 50,
        };
        let mut out = Buf::new();
        header.serialize(&mut out);
        assert_eq!(out.len(), HANDSHAKE_HEADER_LEN);
        let (rest, parsed) = Header::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, header);
        assert!(parsed.is_fragment());
    }

    #[test]
    fn fragments_cover_body() {
        let hs = Handshake::new(MessageType::ClientKeyExchange, 4, (0..=255u8).collect());
        let frags = hs.fragments(100);
        assert_eq!(frags.len(), 3);

        let mut body = Vec::new();
        for f in &frags {
            let (rest, frag) = HandshakeFragment::parse(f).unwrap();
            assert!(rest.is_empty());
            assert_eq!(frag.header.message_seq, 4, "fragments share message_seq");
            assert_eq!(frag.header.length, 256);
            assert_eq!(frag.header.fragment_offset as usize, body.len());
            body.extend_from_slice(&frag.data);
        }
        assert_eq!(body, hs.body);
    }

    #[test]
    fn parse_all_reads_coalesced() {
        let mut out = Buf::new();
        Body::ServerHelloDone.into_handshake(3).serialize(&mut out);
        Body::HelloRequest.into_handshake(4).serialize(&mut out);
        let all = HandshakeFragment::parse_all(&out).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].header.msg_type, MessageType::HelloRequest);
    }

    #[test]
    fn rejects_fragment_beyond_length() {
        let header = Header {
            msg_type: MessageType::Finished,
            length: 12,
            message_seq: 0,
            fragment_offset: 8,
            fragment_length: 8,
        };
        let mut out = Buf::new();
        header.serialize(&mut out);
        out.extend_from_slice(&[0; 8]);
        assert!(HandshakeFragment::parse(&out).is_err());
    }
}

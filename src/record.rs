//! DTLS 1.2 record layer framing (RFC 6347 4.1, RFC 9146 for connection ids).

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use nom::bytes::complete::take;
use nom::error::{Error as NomError, ErrorKind};
use nom::number::complete::be_u16;
use nom::{Err, IResult};

use crate::buffer::Buf;
use crate::message::{ConnectionId, MessageType, Random, HANDSHAKE_HEADER_LEN};
use crate::types::{ContentType, ProtocolVersion, Sequence};
use crate::util::be_u48;

/// content_type(1) + version(2) + epoch(2) + seq(6) + length(2)
pub const RECORD_HEADER_LEN: usize = 13;

/// One record as received from a peer, not yet decrypted.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    /// Content type as found on the wire. `Tls12Cid` for connection id records.
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub sequence: Sequence,
    pub cid: Option<ConnectionId>,
    /// Protected (epoch > 0) or plain fragment.
    pub fragment: Vec<u8>,
    pub peer: SocketAddr,
    pub received: Instant,
}

impl Record {
    /// Parse all records of a datagram.
    ///
    /// Parsing stops at the first record that cannot be parsed; its bytes and
    /// everything after are dropped. `cid_len` is the length of the connection
    /// ids this side issued, `None` if it issues none.
    pub fn parse_datagram(
        datagram: &[u8],
        peer: SocketAddr,
        cid_len: Option<usize>,
        received: Instant,
    ) -> Vec<Record> {
        let mut records = Vec::new();
        let mut input = datagram;

        while !input.is_empty() {
            match Self::parse(input, cid_len) {
                Ok((rest, (content_type, version, sequence, cid, fragment))) => {
                    records.push(Record {
                        content_type,
                        version,
                        sequence,
                        cid,
                        fragment: fragment.to_vec(),
                        peer,
                        received,
                    });
                    input = rest;
                }
                Err(_) => {
                    trace!(
                        "Dropping {} unparsable bytes of datagram from {}",
                        input.len(),
                        peer
                    );
                    break;
                }
            }
        }

        records
    }

    #[allow(clippy::type_complexity)]
    fn parse(
        input: &[u8],
        cid_len: Option<usize>,
    ) -> IResult<
        &[u8],
        (
            ContentType,
            ProtocolVersion,
            Sequence,
            Option<ConnectionId>,
            &[u8],
        ),
    > {
        let (input, content_type) = ContentType::parse(input)?;
        let (input, version) = ProtocolVersion::parse(input)?;

        // DTLS 1.0 is allowed in the record layer of the first ClientHello.
        if !matches!(version, ProtocolVersion::DTLS1_0 | ProtocolVersion::DTLS1_2) {
            return Err(Err::Failure(NomError::new(input, ErrorKind::Tag)));
        }

        let (input, epoch) = be_u16(input)?;
        let (input, sequence_number) = be_u48(input)?;

        let (input, cid) = match content_type {
            ContentType::Tls12Cid => {
                // Only records with our own (fixed length) cids can be parsed.
                let len = match cid_len {
                    Some(len) if len > 0 => len,
                    _ => return Err(Err::Failure(NomError::new(input, ErrorKind::Verify))),
                };
                let (input, data) = take(len)(input)?;
                let cid = ConnectionId::try_new(data)
                    .map_err(|_| Err::Failure(NomError::new(input, ErrorKind::LengthValue)))?;
                (input, Some(cid))
            }
            ContentType::ChangeCipherSpec
            | ContentType::Alert
            | ContentType::Handshake
            | ContentType::ApplicationData => (input, None),
            ContentType::Unknown(_) | ContentType::Invalid => {
                return Err(Err::Failure(NomError::new(input, ErrorKind::Switch)));
            }
        };

        let (input, length) = be_u16(input)?;
        let (rest, fragment) = take(length as usize)(input)?;

        let sequence = Sequence {
            epoch,
            sequence_number,
        };

        Ok((rest, (content_type, version, sequence, cid, fragment)))
    }

    /// Serialize a record header and (already protected) fragment.
    pub fn encode(
        content_type: ContentType,
        sequence: Sequence,
        cid: Option<&ConnectionId>,
        fragment: &[u8],
        output: &mut Buf,
    ) {
        output.push(content_type.as_u8());
        ProtocolVersion::DTLS1_2.serialize(output);
        output.extend_from_slice(&sequence.to_bytes());
        if let Some(cid) = cid {
            output.extend_from_slice(cid);
        }
        output.push_u16(fragment.len() as u16);
        output.extend_from_slice(fragment);
    }

    /// Whether this is a plain CLIENT_HELLO, i.e. a handshake attempt.
    pub fn is_client_hello(&self) -> bool {
        self.sequence.epoch == 0
            && self.content_type == ContentType::Handshake
            && self.fragment.first().map(|b| MessageType::from_u8(*b))
                == Some(MessageType::ClientHello)
    }

    /// Random of a plain CLIENT_HELLO starting in this record.
    pub fn client_hello_random(&self) -> Option<Random> {
        if !self.is_client_hello() {
            return None;
        }
        // client_version(2) precedes the random.
        let start = HANDSHAKE_HEADER_LEN + 2;
        let body = self.fragment.get(start..)?;
        Random::parse(body).ok().map(|(_, random)| random)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("content_type", &self.content_type)
            .field("sequence", &self.sequence)
            .field("cid", &self.cid)
            .field("length", &self.fragment.len())
            .field("peer", &self.peer)
            .finish()
    }
}

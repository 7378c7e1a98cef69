use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::{be_u16, be_u8};
use nom::{Err, IResult};

use super::ConnectionId;
use crate::buffer::Buf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionType {
    ServerName,
    ConnectionId,
    Unknown(u16),
}

impl ExtensionType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => ExtensionType::ServerName,
            54 => ExtensionType::ConnectionId,
            _ => ExtensionType::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ExtensionType::ServerName => 0,
            ExtensionType::ConnectionId => 54,
            ExtensionType::Unknown(value) => *value,
        }
    }
}

const HOST_NAME: u8 = 0;

/// The hello extensions this crate understands.
///
/// Unknown extensions are skipped when parsing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extensions {
    /// SNI host name (RFC 6066).
    pub server_name: Option<String>,
    /// Connection id the sender wants to receive records with (RFC 9146).
    /// An empty id signals support without wanting to receive one.
    pub connection_id: Option<ConnectionId>,
}

impl Extensions {
    pub fn is_empty(&self) -> bool {
        self.server_name.is_none() && self.connection_id.is_none()
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Extensions> {
        let mut extensions = Extensions::default();

        if input.is_empty() {
            return Ok((input, extensions));
        }

        let (rest, extensions_len) = be_u16(input)?;
        let (rest, mut data) = take(extensions_len)(rest)?;

        while !data.is_empty() {
            let (d, extension_type) = be_u16(data)?;
            let (d, len) = be_u16(d)?;
            let (d, body) = take(len)(d)?;
            data = d;

            match ExtensionType::from_u16(extension_type) {
                ExtensionType::ServerName => {
                    extensions.server_name = Self::parse_server_name(body)?.1;
                }
                ExtensionType::ConnectionId => {
                    let (_, cid) = ConnectionId::parse(body)?;
                    extensions.connection_id = Some(cid);
                }
                ExtensionType::Unknown(_) => {}
            }
        }

        Ok((rest, extensions))
    }

    fn parse_server_name(input: &[u8]) -> IResult<&[u8], Option<String>> {
        // Empty server_name in a ServerHello acknowledges the client's.
        if input.is_empty() {
            return Ok((input, None));
        }
        let (input, list_len) = be_u16(input)?;
        let (rest, mut list) = take(list_len)(input)?;
        let mut name = None;
        while !list.is_empty() {
            let (l, name_type) = be_u8(list)?;
            let (l, len) = be_u16(l)?;
            let (l, host) = take(len)(l)?;
            list = l;
            if name_type == HOST_NAME {
                let host = std::str::from_utf8(host)
                    .map_err(|_| Err::Failure(Error::new(host, ErrorKind::Verify)))?;
                name = Some(host.to_string());
            }
        }
        Ok((rest, name))
    }

    pub fn serialize(&self, output: &mut Buf) {
        if self.is_empty() {
            return;
        }

        let mut body = Buf::new();

        if let Some(name) = &self.server_name {
            let host = name.as_bytes();
            body.push_u16(ExtensionType::ServerName.as_u16());
            body.push_u16((host.len() + 5) as u16);
            body.push_u16((host.len() + 3) as u16);
            body.push(HOST_NAME);
            body.push_u16(host.len() as u16);
            body.extend_from_slice(host);
        }

        if let Some(cid) = &self.connection_id {
            body.push_u16(ExtensionType::ConnectionId.as_u16());
            body.push_u16((cid.len() + 1) as u16);
            cid.serialize(&mut body);
        }

        output.push_u16(body.len() as u16);
        output.extend_from_slice(&body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_both() {
        let ext = Extensions {
            server_name: Some("example.org".into()),
            connection_id: Some(ConnectionId::try_new(&[1, 2, 3]).unwrap()),
        };
        let mut out = Buf::new();
        ext.serialize(&mut out);
        let (rest, parsed) = Extensions::parse(&out).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, ext);
    }

    #[test]
    fn empty_serializes_to_nothing() {
        let mut out = Buf::new();
        Extensions::default().serialize(&mut out);
        assert!(out.is_empty());
        let (_, parsed) = Extensions::parse(&out).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn skips_unknown() {
        // extensions len 6: type 0x000f len 2 data [1,2]
        let data = [0, 6, 0, 0x0f, 0, 2, 1, 2];
        let (rest, parsed) = Extensions::parse(&data).unwrap();
        assert!(rest.is_empty());
        assert!(parsed.is_empty());
    }
}

use nom::bytes::complete::take;
use nom::error::{Error, ErrorKind};
use nom::number::complete::be_u8;
use nom::{Err, IResult};
use std::fmt;
use std::ops::Deref;

use crate::buffer::Buf;
use crate::rng::SeededRng;

/// Length of an identifier outside its allowed bounds.
pub struct InvalidLength(&'static str, usize, usize, usize);

impl fmt::Debug for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for InvalidLength {}

impl fmt::Display for InvalidLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Incorrect variable ID ({}) length: {} <= {} <= {}",
            self.0, self.1, self.3, self.2,
        )
    }
}

macro_rules! var_array {
    ($name:ident, $min:expr, $max:expr) => {
        #[derive(Clone, Copy)]
        pub struct $name([u8; $max], usize);

        impl $name {
            pub const MAX_LEN: usize = $max;

            pub fn empty() -> Self {
                $name([0; $max], 0)
            }

            pub fn try_new(data: &[u8]) -> Result<Self, InvalidLength> {
                #[allow(unused_comparisons)]
                if data.len() < $min || data.len() > $max {
                    return Err(InvalidLength(stringify!($name), $min, $max, data.len()));
                }
                let mut array = [0; $max];
                array[..data.len()].copy_from_slice(data);
                Ok($name(array, data.len()))
            }

            /// Random identifier of `len` bytes, clamped to the allowed bounds.
            pub fn random(len: usize, rng: &SeededRng) -> $name {
                let len = len.clamp($min, $max);
                let mut arr = [0; $max];
                rng.fill(&mut arr[..len]);
                Self(arr, len)
            }

            /// Parse an identifier preceded by its one byte length.
            pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
                let (input, len) = be_u8(input)?;
                if (len as usize) < $min || (len as usize) > $max {
                    return Err(Err::Failure(Error::new(input, ErrorKind::LengthValue)));
                }
                let (input, data) = take(len as usize)(input)?;
                let mut array = [0; $max];
                array[..data.len()].copy_from_slice(data);
                Ok((input, $name(array, data.len())))
            }

            /// Serialize with the one byte length prefix.
            pub fn serialize(&self, output: &mut Buf) {
                output.push(self.1 as u8);
                output.extend_from_slice(self);
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(", stringify!($name))?;
                for b in &self.0[..self.1] {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ")")
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.deref() == other.deref()
            }
        }

        impl Eq for $name {}

        impl std::hash::Hash for $name {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                self.deref().hash(state)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::empty()
            }
        }

        impl Deref for $name {
            type Target = [u8];

            fn deref(&self) -> &Self::Target {
                &self.0[..self.1]
            }
        }

        impl<'a> TryFrom<&'a [u8]> for $name {
            type Error = InvalidLength;

            fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
                Self::try_new(value)
            }
        }
    };
}

var_array!(SessionId, 0, 32);
var_array!(Cookie, 0, 255);
var_array!(ConnectionId, 0, 255);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_bounds() {
        assert!(SessionId::try_new(&[0; 32]).is_ok());
        assert!(SessionId::try_new(&[0; 33]).is_err());
        assert!(SessionId::empty().is_empty());
    }

    #[test]
    fn parse_rejects_oversized_session_id() {
        let mut data = vec![33u8];
        data.extend_from_slice(&[1; 33]);
        assert!(SessionId::parse(&data).is_err());
    }

    #[test]
    fn random_is_seeded() {
        let a = ConnectionId::random(6, &SeededRng::new(Some(1)));
        let b = ConnectionId::random(6, &SeededRng::new(Some(1)));
        assert_eq!(a.len(), 6);
        assert_eq!(a, b);
    }

    #[test]
    fn display_is_hex() {
        let id = SessionId::try_new(&[0xab, 0x01]).unwrap();
        assert_eq!(id.to_string(), "SessionId(ab01)");
    }
}

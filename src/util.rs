use std::ops::RangeFrom;

use nom::error::{make_error, ErrorKind, ParseError};
use nom::{Err, IResult, InputIter, InputLength, Parser, Slice};
use tinyvec::{Array, TinyVec};

/// Like `nom::multi::many0`, but collecting into a `TinyVec` that only
/// allocates when the inline capacity is exceeded.
#[inline(always)]
pub fn many0<I, O, E, F, A>(mut f: F) -> impl FnMut(I) -> IResult<I, TinyVec<A>, E>
where
    I: Clone + InputLength,
    F: Parser<I, O, E>,
    E: ParseError<I>,
    A: Array<Item = O>,
{
    move |mut i: I| {
        let mut acc = TinyVec::default();
        loop {
            let len = i.input_len();
            match f.parse(i.clone()) {
                Err(Err::Error(_)) => return Ok((i, acc)),
                Err(e) => return Err(e),
                Ok((i1, o)) => {
                    // infinite loop check: the parser must always consume
                    if i1.input_len() == len {
                        return Err(Err::Error(E::from_error_kind(i, ErrorKind::Many0)));
                    }

                    i = i1;
                    acc.push(o);
                }
            }
        }
    }
}

pub fn be_u48<I, E: ParseError<I>>(input: I) -> IResult<I, u64, E>
where
    I: Slice<RangeFrom<usize>> + InputIter<Item = u8> + InputLength,
{
    let bound: usize = 6;

    if input.input_len() < bound {
        Err(Err::Error(make_error(input, ErrorKind::Eof)))
    } else {
        let mut res = 0u64;

        for byte in input.iter_elements().take(bound) {
            res = (res << 8) + byte as u64;
        }

        Ok((input.slice(bound..), res))
    }
}

/// Constant time comparison of two byte strings.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use nom::number::complete::be_u16;

    #[test]
    fn be_u48_reads_six_bytes() {
        let input = [0, 0, 0, 0, 1, 2, 9];
        let (rest, n) = be_u48::<_, nom::error::Error<&[u8]>>(&input[..]).unwrap();
        assert_eq!(n, 0x0102);
        assert_eq!(rest, &[9]);
    }

    #[test]
    fn many0_spills_to_heap() {
        let input: Vec<u8> = (0..20u16).flat_map(|n| n.to_be_bytes()).collect();
        let (rest, items): (_, TinyVec<[u16; 4]>) =
            many0::<_, _, nom::error::Error<&[u8]>, _, _>(be_u16)(&input[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(items.len(), 20);
        assert_eq!(items[19], 19);
    }

    #[test]
    fn ct_eq_compares() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}

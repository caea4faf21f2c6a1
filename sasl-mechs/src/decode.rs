use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take, take_while},
    combinator::{all_consuming, map, rest, value},
    sequence::tuple,
    IResult,
};

use super::types::Mechanism;

pub fn mechanism(input: &[u8]) -> IResult<&[u8], Mechanism> {
    alt((
        value(Mechanism::External, tag_no_case(b"EXTERNAL")),
        value(Mechanism::Plain, tag_no_case(b"PLAIN")),
        value(Mechanism::Login, tag_no_case(b"LOGIN")),
        value(Mechanism::Anonymous, tag_no_case(b"ANONYMOUS")),
    ))(input)
}

pub fn mechanism_name(input: &str) -> Option<Mechanism> {
    all_consuming(mechanism)(input.trim().as_bytes())
        .ok()
        .map(|(_, mech)| mech)
}

fn not_null(c: u8) -> bool {
    c != 0x0
}

// impersonated user, login, password
pub fn auth_plain<'a>(input: &'a [u8]) -> IResult<&'a [u8], (&'a [u8], &'a [u8], &'a [u8])> {
    map(
        tuple((
            take_while(not_null),
            take(1usize),
            take_while(not_null),
            take(1usize),
            rest,
        )),
        |(imp, _, user, _, pass)| (imp, user, pass),
    )(input)
}

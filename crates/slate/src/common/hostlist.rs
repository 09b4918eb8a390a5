//! Compact node-name range encoding: `"prefix[lo-hi,n,…]"`.
//!
//! `encode . decode` is the identity on legal inputs; `decode . encode`
//! is the identity modulo canonical ordering of the ranges.

use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, digit1};
use nom::combinator::{all_consuming, map, opt};
use nom::multi::separated_list1;
use nom::sequence::{delimited, pair, preceded};

use crate::common::error::SlateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NumToken {
    value: u32,
    width: usize,
}

#[derive(Debug, Clone, Copy)]
struct HostRange {
    lo: NumToken,
    hi: NumToken,
}

#[derive(Debug)]
enum HostExpr<'a> {
    Plain(&'a str),
    Ranged(&'a str, Vec<HostRange>),
}

fn p_number(input: &str) -> IResult<&str, NumToken> {
    map(digit1, |digits: &str| NumToken {
        // Width of the numeric token is kept so that "01-03" expands with
        // its zero padding intact.
        value: digits.parse().unwrap_or(u32::MAX),
        width: digits.len(),
    })(input)
}

fn p_range(input: &str) -> IResult<&str, HostRange> {
    map(
        pair(p_number, opt(preceded(char('-'), p_number))),
        |(lo, hi)| HostRange {
            lo,
            hi: hi.unwrap_or(lo),
        },
    )(input)
}

fn p_prefix(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != '[' && c != ',' && c != ']')(input)
}

fn p_expr(input: &str) -> IResult<&str, HostExpr> {
    alt((
        map(
            pair(
                p_prefix,
                delimited(char('['), separated_list1(char(','), p_range), char(']')),
            ),
            |(prefix, ranges)| HostExpr::Ranged(prefix, ranges),
        ),
        map(p_prefix, HostExpr::Plain),
    ))(input)
}

fn p_hostlist(input: &str) -> IResult<&str, Vec<HostExpr>> {
    all_consuming(separated_list1(char(','), p_expr))(input)
}

/// Expands a hostlist expression into individual node names.
///
/// Ranges may appear out of order and with mixed widths; each range pads
/// its members to the width of its low bound.
pub fn decode(input: &str) -> crate::Result<Vec<String>> {
    let (_, exprs) = p_hostlist(input)
        .map_err(|e| SlateError::InvalidRequest(format!("malformed hostlist '{input}': {e}")))?;
    let mut names = Vec::new();
    for expr in exprs {
        match expr {
            HostExpr::Plain(name) => names.push(name.to_string()),
            HostExpr::Ranged(prefix, ranges) => {
                for range in ranges {
                    if range.hi.value < range.lo.value {
                        return Err(SlateError::InvalidRequest(format!(
                            "inverted range in hostlist '{input}'"
                        )));
                    }
                    for value in range.lo.value..=range.hi.value {
                        names.push(format!("{}{:0width$}", prefix, value, width = range.lo.width));
                    }
                }
            }
        }
    }
    Ok(names)
}

fn split_name(name: &str) -> (&str, Option<NumToken>) {
    let digits = name.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return (name, None);
    }
    let split = name.len() - digits;
    let suffix = &name[split..];
    match suffix.parse::<u32>() {
        Ok(value) => (
            &name[..split],
            Some(NumToken {
                value,
                width: suffix.len(),
            }),
        ),
        Err(_) => (name, None),
    }
}

/// True when `value` printed with `width` matches the token exactly,
/// meaning two tokens can be merged into one zero-padded range.
fn same_padding(a: NumToken, b: NumToken) -> bool {
    a.width == b.width || (a.width == digit_count(a.value) && b.width == digit_count(b.value))
}

fn digit_count(value: u32) -> usize {
    if value == 0 { 1 } else { (value.ilog10() + 1) as usize }
}

/// Encodes node names into the canonical `"prefix[lo-hi,…]"` form.
///
/// Names sharing a prefix are merged; distinct prefixes are joined with
/// commas in first-seen order.
pub fn encode<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: crate::Map<&str, Vec<NumToken>> = crate::Map::default();
    let mut plain: Vec<&str> = Vec::new();

    for name in names {
        match split_name(name) {
            (prefix, Some(token)) => {
                if !groups.contains_key(prefix) {
                    order.push(prefix);
                }
                groups.entry(prefix).or_default().push(token);
            }
            (_, None) => plain.push(name),
        }
    }

    let mut parts: Vec<String> = Vec::new();
    for prefix in order {
        let mut tokens = groups.remove(prefix).unwrap();
        tokens.sort_by_key(|t| (t.value, t.width));
        tokens.dedup();

        let mut ranges: Vec<(NumToken, NumToken)> = Vec::new();
        for token in tokens {
            match ranges.last_mut() {
                Some((lo, hi))
                    if hi.value + 1 == token.value && same_padding(*hi, token) && same_padding(*lo, token) =>
                {
                    *hi = token;
                }
                _ => ranges.push((token, token)),
            }
        }

        let body = ranges
            .iter()
            .map(|(lo, hi)| {
                if lo.value == hi.value {
                    format!("{:0width$}", lo.value, width = lo.width)
                } else {
                    format!(
                        "{:0wl$}-{:0wh$}",
                        lo.value,
                        hi.value,
                        wl = lo.width,
                        wh = hi.width
                    )
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        parts.push(format!("{prefix}[{body}]"));
    }
    for name in plain {
        parts.push(name.to_string());
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple() {
        assert_eq!(
            decode("linux[01-03]").unwrap(),
            vec!["linux01", "linux02", "linux03"]
        );
        assert_eq!(decode("login1").unwrap(), vec!["login1"]);
    }

    #[test]
    fn test_decode_mixed_widths_and_order() {
        assert_eq!(
            decode("n[10-11,7,002]").unwrap(),
            vec!["n10", "n11", "n7", "n002"]
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("n[1-").is_err());
        assert!(decode("n[2-1]").is_err());
        assert!(decode("").is_err());
    }

    #[test]
    fn test_encode_merges_runs() {
        assert_eq!(
            encode(["linux01", "linux02", "linux03", "linux07"]),
            "linux[01-03,07]"
        );
    }

    #[test]
    fn test_encode_distinct_prefixes() {
        assert_eq!(encode(["a1", "a2", "b9", "login"]), "a[1-2],b[9],login");
    }

    #[test]
    fn test_encode_does_not_merge_incompatible_padding() {
        // "n7" and "n08" cannot share a zero-padded range
        assert_eq!(encode(["n7", "n08"]), "n[7,08]");
    }

    #[test]
    fn test_roundtrip_identity() {
        for input in ["linux[01-04]", "r[1-3,5]", "gpu[08-11],cpu[1-2]"] {
            let names = decode(input).unwrap();
            let encoded = encode(names.iter().map(|s| s.as_str()));
            assert_eq!(decode(&encoded).unwrap(), names, "roundtrip of {input}");
        }
    }

    #[test]
    fn test_encode_decode_canonical() {
        let names = vec!["linux04", "linux02", "linux03", "linux01"];
        let encoded = encode(names.iter().copied());
        assert_eq!(encoded, "linux[01-04]");
        assert_eq!(
            decode(&encoded).unwrap(),
            vec!["linux01", "linux02", "linux03", "linux04"]
        );
    }
}

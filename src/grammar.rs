//! Grammar recognizers (spec.md §4.2), implemented as a small recursive-
//! descent scanner rather than a regex table (spec.md §9 design note:
//! "a recursive-descent parser over the grammar is recommended for clarity
//! and error quality"). Each function recognizes one grammar fragment of
//! the `DESC` grammar in spec.md §6.

use crate::error::{DescriptorLibError, Result};

/// One derivation-path level, already distinguishing a tuple (multipath) or
/// wildcard level from a fixed child number. `Fixed` carries the raw BIP32
/// child number with the hardened bit (`0x8000_0000`) already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Fixed(u32),
    /// `<a;b;...>`: strictly increasing plain (non-hardened) child numbers.
    Tuple(Vec<u32>),
    /// `*`: the ranged-descriptor wildcard.
    Wildcard,
}

/// A parsed `[FP/path]` origin: fingerprint plus the levels from the master
/// key to the extended-key root. Always concrete (no tuples/wildcards).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub fingerprint: [u8; 4],
    pub path: Vec<u32>,
}

fn is_hardened_marker(c: char) -> bool {
    matches!(c, '\'' | 'h' | 'H')
}

/// Parses one `LEVEL := UINT ("'" | "h" | "H")?` token into a raw BIP32
/// child number (hardened bit applied). Fails on overflow at `2^31`
/// (spec.md §4.4's "reject hardened children >= 2^31").
pub fn parse_level(token: &str) -> Result<u32> {
    let (digits, hardened) = match token.chars().last() {
        Some(c) if is_hardened_marker(c) => (&token[..token.len() - 1], true),
        _ => (token, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DescriptorLibError::key_expression(format!(
            "invalid path level '{token}'"
        )));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| DescriptorLibError::key_expression(format!("path level '{token}' too large")))?;
    if value >= 0x8000_0000 {
        return Err(DescriptorLibError::key_expression(format!(
            "path level {value} overflows the hardened range (>= 2^31)"
        )));
    }
    Ok(if hardened {
        value as u32 | 0x8000_0000
    } else {
        value as u32
    })
}

/// Parses a `TUPLE := "<" UINT (";" UINT)+ ">"` fragment's *inner* text
/// (without the angle brackets) into the list of values, checked for strict
/// monotonic increase (spec.md §4.8 "strictly increasing decimal values").
pub fn parse_tuple_inner(inner: &str) -> Result<Vec<u32>> {
    let mut values = Vec::new();
    for part in inner.split(';') {
        let v: u32 = part
            .parse()
            .map_err(|_| DescriptorLibError::range(format!("invalid tuple value '{part}'")))?;
        values.push(v);
    }
    if values.len() < 2 {
        return Err(DescriptorLibError::range("a multipath tuple needs at least 2 values"));
    }
    if !values.windows(2).all(|w| w[0] < w[1]) {
        return Err(DescriptorLibError::range(format!(
            "multipath tuple {values:?} is not strictly increasing"
        )));
    }
    Ok(values)
}

/// Parses the `PATH := ("/" LEVEL | "/" TUPLE | "/*" | "/**")+` fragment
/// that follows a key expression (the leading `/` is not included in
/// `path_text`; callers split on `/` themselves). `/**` is sugar for
/// `/<0;1>/*` per spec.md §4.8.
pub fn parse_path(path_text: &str) -> Result<Vec<PathStep>> {
    if path_text.is_empty() {
        return Ok(Vec::new());
    }
    let mut steps = Vec::new();
    for segment in path_text.split('/') {
        if segment.is_empty() {
            return Err(DescriptorLibError::descriptor_parse("empty path segment"));
        }
        if segment == "**" {
            steps.push(PathStep::Tuple(vec![0, 1]));
            steps.push(PathStep::Wildcard);
        } else if segment == "*" {
            steps.push(PathStep::Wildcard);
        } else if segment.starts_with('<') && segment.ends_with('>') {
            let inner = &segment[1..segment.len() - 1];
            steps.push(PathStep::Tuple(parse_tuple_inner(inner)?));
        } else {
            steps.push(PathStep::Fixed(parse_level(segment)?));
        }
    }
    Ok(steps)
}

/// Parses an `ORIGIN := "[" 8HEX ("/" LEVEL)* "]"` fragment (brackets
/// included). Returns `None` if `text` doesn't start with `[`.
pub fn parse_origin(text: &str) -> Result<Option<(Origin, &str)>> {
    if !text.starts_with('[') {
        return Ok(None);
    }
    let end = text
        .find(']')
        .ok_or_else(|| DescriptorLibError::key_expression("unterminated origin '['"))?;
    let inner = &text[1..end];
    let mut parts = inner.splitn(2, '/');
    let fp_hex = parts.next().unwrap_or("");
    if fp_hex.len() != 8 || !fp_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DescriptorLibError::key_expression(format!(
            "origin fingerprint '{fp_hex}' must be 8 hex characters"
        )));
    }
    let mut fingerprint = [0u8; 4];
    hex::decode_to_slice(fp_hex, &mut fingerprint)
        .map_err(|e| DescriptorLibError::key_expression(format!("bad origin fingerprint: {e}")))?;
    let path = match parts.next() {
        Some(levels) if !levels.is_empty() => levels
            .split('/')
            .map(parse_level)
            .collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };
    Ok(Some((Origin { fingerprint, path }, &text[end + 1..])))
}

/// Splits top-level comma-separated arguments of a `NAME(...)` fragment,
/// respecting nested parentheses, brackets and angle-bracket tuples. Used
/// both for descriptor-form dispatch and for miniscript fragment arguments.
pub fn split_top_level_args(s: &str) -> Vec<&str> {
    let mut depth = 0i32;
    let mut start = 0usize;
    let mut out = Vec::new();
    for (i, c) in s.char_indices() {
        match c {
            '(' | '[' | '<' | '{' => depth += 1,
            ')' | ']' | '>' | '}' => depth -= 1,
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

/// Splits `NAME(ARGS)` into `(NAME, ARGS)`. Fails if the trailing `)` doesn't
/// match the opening `(` at top level (e.g. trailing garbage).
pub fn split_function(s: &str) -> Result<(&str, &str)> {
    let open = s
        .find('(')
        .ok_or_else(|| DescriptorLibError::descriptor_parse(format!("missing '(' in '{s}'")))?;
    if !s.ends_with(')') {
        return Err(DescriptorLibError::descriptor_parse(format!(
            "missing closing ')' in '{s}'"
        )));
    }
    let name = &s[..open];
    let args = &s[open + 1..s.len() - 1];
    // Verify the final ')' actually closes the opening '(' (i.e. they're at
    // the same nesting depth), not some unrelated inner fragment's paren.
    let mut depth = 0i32;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 && i != s.len() - 1 {
                    return Err(DescriptorLibError::descriptor_parse(format!(
                        "trailing characters after top-level form in '{s}'"
                    )));
                }
            }
            _ => {}
        }
    }
    Ok((name, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_hardened_levels() {
        assert_eq!(parse_level("0").unwrap(), 0);
        assert_eq!(parse_level("1'").unwrap(), 0x8000_0001);
        assert_eq!(parse_level("44h").unwrap(), 0x8000_002C);
        assert_eq!(parse_level("2H").unwrap(), 0x8000_0002);
    }

    #[test]
    fn rejects_hardened_overflow() {
        assert!(parse_level("2147483648").is_err());
        assert!(parse_level("2147483648'").is_err());
    }

    #[test]
    fn parses_origin() {
        let (origin, rest) = parse_origin("[d34db33f/49'/0'/0']tpub...").unwrap().unwrap();
        assert_eq!(origin.fingerprint, [0xd3, 0x4d, 0xb3, 0x3f]);
        assert_eq!(origin.path, vec![0x8000_0031, 0x8000_0000, 0x8000_0000]);
        assert_eq!(rest, "tpub...");
    }

    #[test]
    fn rejects_short_fingerprint() {
        assert!(parse_origin("[abcd]xpub...").is_err());
    }

    #[test]
    fn parses_tuple_and_wildcard_path() {
        let steps = parse_path("<0;1>/*").unwrap();
        assert_eq!(steps, vec![PathStep::Tuple(vec![0, 1]), PathStep::Wildcard]);
    }

    #[test]
    fn double_star_desugars() {
        let steps = parse_path("**").unwrap();
        assert_eq!(steps, vec![PathStep::Tuple(vec![0, 1]), PathStep::Wildcard]);
    }

    #[test]
    fn rejects_non_increasing_tuple() {
        assert!(parse_tuple_inner("1;0").is_err());
        assert!(parse_tuple_inner("0;0").is_err());
    }

    #[test]
    fn splits_top_level_args_respecting_nesting() {
        let args = split_top_level_args("pk(A),pk(B),older(5)");
        assert_eq!(args, vec!["pk(A)", "pk(B)", "older(5)"]);
    }

    #[test]
    fn splits_function_name_and_args() {
        let (name, args) = split_function("sh(wpkh(KEY))").unwrap();
        assert_eq!(name, "sh");
        assert_eq!(args, "wpkh(KEY)");
    }

    #[test]
    fn split_function_rejects_trailing_garbage() {
        assert!(split_function("sh(wpkh(KEY))x").is_err());
    }
}

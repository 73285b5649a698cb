use std::sync::OnceLock;

use regex::bytes::{Captures, Regex};

use super::memory::Word;
use super::{VmError, VmResult};

/// Upper bound on substitution values a single `PRTF` can consume.
pub const MAX_VALUES: usize = 5;

fn conversion_pattern() -> VmResult<&'static Regex> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"%([-+ 0#]*)(\d+)?(?:\.(\d*))?(hh|h|ll|l|z|j|t)?([diouxXcsp%])")
        })
        .as_ref()
        .map_err(|err| VmError::HostError(format!("printf pattern: {err}")))
}

#[derive(Clone, Copy, Debug, Default)]
struct Directive {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
    width: usize,
    precision: Option<usize>,
    bits: u32,
    conversion: u8,
}

impl Directive {
    fn parse(caps: &Captures<'_>) -> Self {
        let mut directive = Directive {
            bits: 32,
            ..Directive::default()
        };
        for &flag in caps.get(1).map(|m| m.as_bytes()).unwrap_or_default() {
            match flag {
                b'-' => directive.left = true,
                b'+' => directive.plus = true,
                b' ' => directive.space = true,
                b'0' => directive.zero = true,
                b'#' => directive.alt = true,
                _ => {}
            }
        }
        directive.width = caps.get(2).map(|m| parse_count(m.as_bytes())).unwrap_or(0);
        directive.precision = caps.get(3).map(|m| parse_count(m.as_bytes()));
        directive.bits = match caps.get(4).map(|m| m.as_bytes()) {
            Some(b"hh") => 8,
            Some(b"h") => 16,
            Some(_) => 64,
            None => 32,
        };
        directive.conversion = caps
            .get(5)
            .and_then(|m| m.as_bytes().first().copied())
            .unwrap_or(b'%');
        directive
    }
}

fn parse_count(digits: &[u8]) -> usize {
    digits
        .iter()
        .fold(0usize, |acc, d| acc.saturating_mul(10).saturating_add((d - b'0') as usize))
}

/// Renders a C-style format string against at most [`MAX_VALUES`] values.
///
/// `%s` values are guest addresses; `string_at` resolves them to bytes.
pub fn format(
    template: &[u8],
    values: &[Word],
    mut string_at: impl FnMut(Word) -> VmResult<Vec<u8>>,
) -> VmResult<Vec<u8>> {
    let mut out = Vec::with_capacity(template.len());
    let mut next_value = values.iter().take(MAX_VALUES).copied();
    let mut consumed = 0usize;
    let mut last = 0usize;

    for caps in conversion_pattern()?.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.extend_from_slice(&template[last..whole.start()]);
        last = whole.end();

        let directive = Directive::parse(&caps);
        if directive.conversion == b'%' {
            out.push(b'%');
            continue;
        }
        consumed += 1;
        let value = next_value.next().ok_or_else(|| {
            VmError::HostError(format!(
                "printf conversion #{consumed} has no value (at most {MAX_VALUES} are passed)"
            ))
        })?;
        let body = match directive.conversion {
            b's' => {
                let mut text = string_at(value)?;
                if let Some(precision) = directive.precision {
                    text.truncate(precision);
                }
                text
            }
            b'c' => vec![value as u8],
            b'p' => format!("0x{:x}", value as u64).into_bytes(),
            _ => render_integer(&directive, value),
        };
        pad(&mut out, &directive, body);
    }
    out.extend_from_slice(&template[last..]);
    Ok(out)
}

fn render_integer(directive: &Directive, value: Word) -> Vec<u8> {
    let signed = matches!(directive.conversion, b'd' | b'i');
    let (negative, magnitude) = if signed {
        let value = truncate_signed(value, directive.bits);
        (value < 0, value.unsigned_abs())
    } else {
        (false, truncate_unsigned(value, directive.bits))
    };

    let mut digits = match directive.conversion {
        b'x' => format!("{magnitude:x}"),
        b'X' => format!("{magnitude:X}"),
        b'o' => format!("{magnitude:o}"),
        _ => magnitude.to_string(),
    };
    if let Some(precision) = directive.precision {
        if precision == 0 && magnitude == 0 {
            digits.clear();
        } else if digits.len() < precision {
            digits = format!("{}{digits}", "0".repeat(precision - digits.len()));
        }
    }

    let mut prefix = String::new();
    if negative {
        prefix.push('-');
    } else if signed && directive.plus {
        prefix.push('+');
    } else if signed && directive.space {
        prefix.push(' ');
    }
    if directive.alt && magnitude != 0 {
        match directive.conversion {
            b'x' => prefix.push_str("0x"),
            b'X' => prefix.push_str("0X"),
            b'o' if !digits.starts_with('0') => prefix.push('0'),
            _ => {}
        }
    }

    if directive.zero && !directive.left && directive.precision.is_none() {
        let used = prefix.len() + digits.len();
        if used < directive.width {
            digits = format!("{}{digits}", "0".repeat(directive.width - used));
        }
    }
    format!("{prefix}{digits}").into_bytes()
}

fn truncate_signed(value: Word, bits: u32) -> i64 {
    match bits {
        8 => value as i8 as i64,
        16 => value as i16 as i64,
        32 => value as i32 as i64,
        _ => value,
    }
}

fn truncate_unsigned(value: Word, bits: u32) -> u64 {
    match bits {
        8 => value as u8 as u64,
        16 => value as u16 as u64,
        32 => value as u32 as u64,
        _ => value as u64,
    }
}

fn pad(out: &mut Vec<u8>, directive: &Directive, body: Vec<u8>) {
    let fill = directive.width.saturating_sub(body.len());
    if directive.left {
        out.extend_from_slice(&body);
        out.resize(out.len() + fill, b' ');
    } else {
        out.resize(out.len() + fill, b' ');
        out.extend_from_slice(&body);
    }
}

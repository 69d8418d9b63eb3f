use anyhow::{bail, Context, Result};
use std::str::FromStr;

/// Reads and parses `name`, falling back to `default` when unset or unparsable.
pub fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default)
}

pub fn env_string_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

/// Turns a delimiter argument into the byte it names.
///
/// Accepts `\t`, `\n`, `\0`, `\xNN` hex and `\NNN` octal escapes; anything
/// else contributes its first byte, like the classic getopt tools did.
pub fn parse_delimiter(arg: &str) -> Result<u8> {
    let bytes = arg.as_bytes();
    if bytes.is_empty() {
        bail!("delimiter must not be empty");
    }
    if bytes[0] != b'\\' || bytes.len() == 1 {
        return Ok(bytes[0]);
    }
    let rest = &arg[1..];
    match rest {
        "t" => return Ok(b'\t'),
        "n" => return Ok(b'\n'),
        "0" => return Ok(0),
        "\\" => return Ok(b'\\'),
        _ => {}
    }
    if let Some(hex) = rest.strip_prefix('x').or_else(|| rest.strip_prefix('X')) {
        return u8::from_str_radix(hex, 16).with_context(|| format!("bad hex delimiter escape {:?}", arg));
    }
    if rest.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return u8::from_str_radix(rest, 8).with_context(|| format!("bad octal delimiter escape {:?}", arg));
    }
    Ok(bytes[0])
}

/// clap `value_parser` adapter for [`parse_delimiter`].
pub fn delimiter_value(arg: &str) -> std::result::Result<u8, String> {
    parse_delimiter(arg).map_err(|e| e.to_string())
}

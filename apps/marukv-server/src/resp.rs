//! RESP codec for the client protocol.
//!
//! Requests are arrays of bulk strings: `*<n>\r\n` followed by `n` items of
//! `$<len>\r\n<bytes>\r\n`. The parser is incremental: it reports how many
//! bytes one complete command consumed so the connection loop can buffer
//! partial reads, and it distinguishes "not enough bytes yet" from a
//! protocol violation.

use std::fmt;

/// Structurally invalid RESP input; the connection answers
/// `-ERR Protocol error` and drops.
#[derive(Debug, PartialEq, Eq)]
pub struct ProtocolError;

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RESP protocol error")
    }
}

impl std::error::Error for ProtocolError {}

/// Try to parse one command from the front of `input`.
///
/// Returns `Ok(Some((args, consumed)))` for a complete command,
/// `Ok(None)` when more bytes are needed, `Err` on malformed input.
pub fn parse_command(input: &str) -> Result<Option<(Vec<String>, usize)>, ProtocolError> {
    if input.is_empty() {
        return Ok(None);
    }
    if !input.starts_with('*') {
        return Err(ProtocolError);
    }

    let Some(header_end) = input.find("\r\n") else {
        return Ok(None);
    };
    let count: usize = input[1..header_end].parse().map_err(|_| ProtocolError)?;

    let mut pos = header_end + 2;
    let mut args = Vec::with_capacity(count);

    for _ in 0..count {
        if pos >= input.len() {
            return Ok(None);
        }
        if input.as_bytes()[pos] != b'$' {
            return Err(ProtocolError);
        }

        let Some(len_end) = input[pos..].find("\r\n").map(|i| pos + i) else {
            return Ok(None);
        };
        let len: usize = input[pos + 1..len_end].parse().map_err(|_| ProtocolError)?;

        let data_start = len_end + 2;
        let data_end = data_start + len;
        if data_end + 2 > input.len() {
            return Ok(None);
        }
        // A declared length that splits a multibyte character is invalid,
        // not a panic.
        let data = input.get(data_start..data_end).ok_or(ProtocolError)?;
        if input.get(data_end..data_end + 2) != Some("\r\n") {
            return Err(ProtocolError);
        }

        args.push(data.to_string());
        pos = data_end + 2;
    }

    Ok(Some((args, pos)))
}

/// `+<text>\r\n`
pub fn encode_status(status: &str) -> String {
    format!("+{status}\r\n")
}

/// `-<text>\r\n`
pub fn encode_error(error: &str) -> String {
    format!("-{error}\r\n")
}

/// `:<n>\r\n`
pub fn encode_integer(value: i64) -> String {
    format!(":{value}\r\n")
}

/// `$<len>\r\n<bytes>\r\n`
pub fn encode_bulk(value: &str) -> String {
    format!("${}\r\n{}\r\n", value.len(), value)
}

/// The nil reply for an absent key.
pub fn encode_nil() -> String {
    "*1\r\n$3\r\nnil\r\n".to_string()
}

/// `*<n>\r\n` followed by bulk items.
pub fn encode_array(items: &[String]) -> String {
    let mut out = format!("*{}\r\n", items.len());
    for item in items {
        out.push_str(&encode_bulk(item));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_command() {
        let input = "*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n";
        let (args, consumed) = parse_command(input).unwrap().unwrap();
        assert_eq!(args, vec!["SET", "a", "1"]);
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn leaves_trailing_bytes_for_next_parse() {
        let first = "*2\r\n$3\r\nGET\r\n$1\r\na\r\n";
        let input = format!("{first}*1\r\n");
        let (args, consumed) = parse_command(&input).unwrap().unwrap();
        assert_eq!(args, vec!["GET", "a"]);
        assert_eq!(consumed, first.len());
    }

    #[test]
    fn incomplete_input_asks_for_more() {
        let full = "*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n";
        for end in 0..full.len() {
            assert_eq!(
                parse_command(&full[..end]).unwrap(),
                None,
                "prefix of length {end} should be incomplete"
            );
        }
    }

    #[test]
    fn malformed_input_rejected() {
        assert!(parse_command("GET a\r\n").is_err());
        assert!(parse_command("*x\r\n").is_err());
        assert!(parse_command("*1\r\n#3\r\nfoo\r\n").is_err());
        // Length shorter than the actual payload leaves no trailing CRLF.
        assert!(parse_command("*1\r\n$2\r\nfoo\r\n").is_err());
    }

    #[test]
    fn length_splitting_a_multibyte_char_rejected() {
        // "é" is two bytes; a declared length of 1 lands mid-character.
        assert!(parse_command("*1\r\n$1\r\né\r\n").is_err());
    }

    #[test]
    fn empty_argument_allowed() {
        let (args, _) = parse_command("*2\r\n$3\r\nGET\r\n$0\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(args, vec!["GET", ""]);
    }

    #[test]
    fn encoders() {
        assert_eq!(encode_status("OK"), "+OK\r\n");
        assert_eq!(encode_error("ERR Protocol error"), "-ERR Protocol error\r\n");
        assert_eq!(encode_integer(2), ":2\r\n");
        assert_eq!(encode_bulk("hello"), "$5\r\nhello\r\n");
        assert_eq!(encode_bulk(""), "$0\r\n\r\n");
        assert_eq!(encode_nil(), "*1\r\n$3\r\nnil\r\n");
        assert_eq!(
            encode_array(&["a".to_string(), "bc".to_string()]),
            "*2\r\n$1\r\na\r\n$2\r\nbc\r\n"
        );
    }
}

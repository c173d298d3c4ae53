//! Switch command grammar.
//!
//! The parameters follow the fixed prefix [`SWITCH_COMMAND`] in one of nine
//! shapes. Several shapes are textual prefixes of others, so the matchers are
//! tried longest/most specific first and the first one that matches wins:
//!
//! ```text
//! 1. NX mode: <mode> options: <options up to '>
//! 2. NX options: <options>
//! 3. NX mode: <mode>
//! 4. SSH port: <port> accept: <host>
//! 5. <host>:<port> in: <fd> out: <fd>
//! 6. SSH in: <fd> out: <fd>
//! 7. <host>:<port> cookie: <cookie>
//! 8. <host>:<port>
//! 9. NX
//! ```
//!
//! Matching follows scanf conventions over raw bytes: whitespace in a pattern
//! matches any run of whitespace (including none), `<word>` fields stop at
//! whitespace, every field has a maximum width in bytes, and text after the
//! last field is ignored. Only fields with a typed meaning (ports,
//! descriptors, the mode) reject bytes they cannot interpret.

use crate::decision::{Descriptor, InternalMode, SwitchDecision};
use crate::dump;
use crate::error::ParseError;
use tracing::{debug, info};

/// The awaited switch command prefix.
pub const SWITCH_COMMAND: &str = "NX> 299 Switch connection to: ";

/// Commands must be strictly shorter than this many bytes.
pub const MAX_COMMAND_LEN: usize = 256;

const HOST_WIDTH: usize = 128;
const PORT_WIDTH: usize = 5;
const COOKIE_WIDTH: usize = 32;
const MODE_WIDTH: usize = 16;
const OPTIONS_WIDTH: usize = 1023;

/// One directive of a scanf-style pattern.
#[derive(Clone, Copy)]
enum Piece {
    /// Literal text; whitespace matches any whitespace run.
    Lit(&'static str),
    /// Up to N non-whitespace bytes, leading whitespace skipped.
    Word(usize),
    /// Up to N bytes accepted by the predicate, no whitespace skipping.
    Set(usize, fn(u8) -> bool),
}

fn is_digit(b: u8) -> bool {
    b.is_ascii_digit()
}

fn not_colon(b: u8) -> bool {
    b != b':'
}

fn not_quote(b: u8) -> bool {
    b != b'\''
}

fn skip_whitespace(s: &[u8]) -> &[u8] {
    let start = s
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(s.len());
    &s[start..]
}

/// Split off the longest prefix of at most `max` bytes accepted by `accept`.
fn take_while_max(s: &[u8], max: usize, accept: impl Fn(u8) -> bool) -> (&[u8], &[u8]) {
    let limit = s.len().min(max);
    let end = s[..limit]
        .iter()
        .position(|&b| !accept(b))
        .unwrap_or(limit);
    s.split_at(end)
}

/// Run a pattern over `input`, returning every converted field and the unconsumed tail.
fn scan<'a>(input: &'a [u8], pattern: &[Piece]) -> Option<(Vec<&'a [u8]>, &'a [u8])> {
    let mut rest = input;
    let mut fields = Vec::with_capacity(pattern.len());

    for piece in pattern {
        match *piece {
            Piece::Lit(text) => {
                for &b in text.as_bytes() {
                    if b.is_ascii_whitespace() {
                        rest = skip_whitespace(rest);
                    } else {
                        rest = rest.strip_prefix(&[b])?;
                    }
                }
            }
            Piece::Word(max) => {
                let (field, tail) =
                    take_while_max(skip_whitespace(rest), max, |b| !b.is_ascii_whitespace());
                if field.is_empty() {
                    return None;
                }
                fields.push(field);
                rest = tail;
            }
            Piece::Set(max, accept) => {
                let (field, tail) = take_while_max(rest, max, accept);
                if field.is_empty() {
                    return None;
                }
                fields.push(field);
                rest = tail;
            }
        }
    }

    Some((fields, rest))
}

/// Raw fields extracted by one grammar, before resolution.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Fields<'a> {
    host: Option<&'a [u8]>,
    port: Option<&'a [u8]>,
    cookie: Option<&'a [u8]>,
    input: Option<&'a [u8]>,
    output: Option<&'a [u8]>,
    accept: Option<&'a [u8]>,
    mode: Option<&'a [u8]>,
    options: Option<&'a [u8]>,
}

type Matcher = for<'a> fn(&'a [u8]) -> Option<Fields<'a>>;

/// The grammars in priority order.
const GRAMMARS: [(&str, Matcher); 9] = [
    ("mode and options", match_mode_and_options),
    ("options", match_options),
    ("mode", match_mode),
    ("port and accept", match_port_and_accept),
    ("host, port and descriptors", match_host_port_and_descriptors),
    ("descriptors", match_descriptors),
    ("host, port and cookie", match_host_port_and_cookie),
    ("host and port", match_host_and_port),
    ("specifier", match_specifier),
];

fn match_mode_and_options(command: &[u8]) -> Option<Fields<'_>> {
    let (f, _) = scan(
        command,
        &[
            Piece::Lit(SWITCH_COMMAND),
            Piece::Lit(" NX mode: "),
            Piece::Word(MODE_WIDTH),
            Piece::Lit(" options: "),
            Piece::Set(OPTIONS_WIDTH, not_quote),
        ],
    )?;
    Some(Fields {
        mode: Some(f[0]),
        options: Some(f[1]),
        ..Default::default()
    })
}

fn match_options(command: &[u8]) -> Option<Fields<'_>> {
    let (f, _) = scan(
        command,
        &[
            Piece::Lit(SWITCH_COMMAND),
            Piece::Lit(" NX options: "),
            Piece::Word(OPTIONS_WIDTH),
        ],
    )?;
    Some(Fields {
        options: Some(f[0]),
        ..Default::default()
    })
}

fn match_mode(command: &[u8]) -> Option<Fields<'_>> {
    let (f, _) = scan(
        command,
        &[
            Piece::Lit(SWITCH_COMMAND),
            Piece::Lit(" NX mode: "),
            Piece::Word(MODE_WIDTH),
        ],
    )?;
    Some(Fields {
        mode: Some(f[0]),
        ..Default::default()
    })
}

fn match_port_and_accept(command: &[u8]) -> Option<Fields<'_>> {
    let (f, _) = scan(
        command,
        &[
            Piece::Lit(SWITCH_COMMAND),
            Piece::Lit(" SSH port: "),
            Piece::Set(PORT_WIDTH, is_digit),
            Piece::Lit(" accept: "),
            Piece::Word(HOST_WIDTH),
        ],
    )?;
    Some(Fields {
        port: Some(f[0]),
        accept: Some(f[1]),
        ..Default::default()
    })
}

fn match_host_port_and_descriptors(command: &[u8]) -> Option<Fields<'_>> {
    let (f, _) = scan(
        command,
        &[
            Piece::Lit(SWITCH_COMMAND),
            Piece::Set(HOST_WIDTH, not_colon),
            Piece::Lit(":"),
            Piece::Set(PORT_WIDTH, is_digit),
            Piece::Lit(" in: "),
            Piece::Set(PORT_WIDTH, is_digit),
            Piece::Lit(" out: "),
            Piece::Set(PORT_WIDTH, is_digit),
        ],
    )?;
    Some(Fields {
        host: Some(f[0]),
        port: Some(f[1]),
        input: Some(f[2]),
        output: Some(f[3]),
        ..Default::default()
    })
}

fn match_descriptors(command: &[u8]) -> Option<Fields<'_>> {
    let (f, _) = scan(
        command,
        &[
            Piece::Lit(SWITCH_COMMAND),
            Piece::Lit(" SSH in: "),
            Piece::Set(PORT_WIDTH, is_digit),
            Piece::Lit(" out: "),
            Piece::Set(PORT_WIDTH, is_digit),
        ],
    )?;
    Some(Fields {
        input: Some(f[0]),
        output: Some(f[1]),
        ..Default::default()
    })
}

fn match_host_port_and_cookie(command: &[u8]) -> Option<Fields<'_>> {
    let (f, _) = scan(
        command,
        &[
            Piece::Lit(SWITCH_COMMAND),
            Piece::Set(HOST_WIDTH, not_colon),
            Piece::Lit(":"),
            Piece::Set(PORT_WIDTH, is_digit),
            Piece::Lit(" cookie: "),
            Piece::Word(COOKIE_WIDTH),
        ],
    )?;
    Some(Fields {
        host: Some(f[0]),
        port: Some(f[1]),
        cookie: Some(f[2]),
        ..Default::default()
    })
}

fn match_host_and_port(command: &[u8]) -> Option<Fields<'_>> {
    let (f, _) = scan(
        command,
        &[
            Piece::Lit(SWITCH_COMMAND),
            Piece::Set(HOST_WIDTH, not_colon),
            Piece::Lit(":"),
            Piece::Set(PORT_WIDTH, is_digit),
        ],
    )?;
    Some(Fields {
        host: Some(f[0]),
        port: Some(f[1]),
        ..Default::default()
    })
}

/// `NX` in any case. Only the first two bytes after the prefix are looked
/// at, so `NX options: ` with empty options and words such as `nxagent`
/// select an internal connection with no options.
fn match_specifier(command: &[u8]) -> Option<Fields<'_>> {
    let (f, _) = scan(command, &[Piece::Lit(SWITCH_COMMAND), Piece::Word(2)])?;
    f[0].eq_ignore_ascii_case(b"NX").then(Fields::default)
}

fn text(field: &[u8]) -> String {
    String::from_utf8_lossy(field).into_owned()
}

fn parse_port(value: &[u8]) -> Result<u16, ParseError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .ok_or_else(|| ParseError::InvalidPort(text(value)))
}

fn parse_descriptor(value: &[u8]) -> Result<Descriptor, ParseError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|v| v.parse::<Descriptor>().ok())
        .ok_or_else(|| ParseError::InvalidDescriptor(text(value)))
}

/// Turn the matched fields into exactly one decision.
fn resolve(fields: Fields<'_>) -> Result<SwitchDecision, ParseError> {
    if let (Some(host), Some(port)) = (fields.host, fields.port) {
        let port = parse_port(port)?;
        let (input, output) = match (fields.input, fields.output) {
            (Some(i), Some(o)) => (Some(parse_descriptor(i)?), Some(parse_descriptor(o)?)),
            _ => (None, None),
        };
        let host = text(host);
        info!(host = %host, port, "identified host and port");
        let cookie = fields.cookie.map(text);
        if let Some(cookie) = &cookie {
            debug!(cookie = %cookie, "identified cookie");
        }
        return Ok(SwitchDecision::External {
            host,
            port,
            cookie,
            input,
            output,
        });
    }

    if let (Some(input), Some(output)) = (fields.input, fields.output) {
        let input = parse_descriptor(input)?;
        let output = parse_descriptor(output)?;
        info!(input, output, "identified descriptors");
        return Ok(SwitchDecision::ForwardDescriptors { input, output });
    }

    if let (Some(accept), Some(port)) = (fields.accept, fields.port) {
        let port = parse_port(port)?;
        let accept_host = text(accept);
        info!(port, accept = %accept_host, "identified port and accept host");
        return Ok(SwitchDecision::ForwardPort { port, accept_host });
    }

    info!("identified internal connection");

    let mode = match fields.mode {
        None | Some(b"default") | Some(b"encrypted") => None,
        Some(b"unencrypted") => {
            info!("identified mode unencrypted");
            Some(InternalMode::Unencrypted)
        }
        Some(other) => return Err(ParseError::UnsupportedMode(text(other))),
    };

    if let Some(options) = fields.options {
        info!(options = %dump::escape(options), "identified options");
    }

    Ok(SwitchDecision::Internal {
        mode,
        options: fields.options.map(<[u8]>::to_vec),
    })
}

/// Parse a complete switch command line (prefix included, terminator excluded).
pub fn parse_switch_command(line: &[u8]) -> Result<SwitchDecision, ParseError> {
    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    if line.len() >= MAX_COMMAND_LEN {
        return Err(ParseError::TooLong(line.len()));
    }

    dump::dump_bytes("searching switch parameters in command", line);

    let (name, fields) = GRAMMARS
        .iter()
        .find_map(|(name, matcher)| matcher(line).map(|fields| (*name, fields)))
        .ok_or(ParseError::Unrecognized)?;

    debug!(grammar = name, "switch command matched");
    resolve(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(params: &str) -> Result<SwitchDecision, ParseError> {
        parse_switch_command(format!("{SWITCH_COMMAND}{params}").as_bytes())
    }

    #[test]
    fn cookie_grammar_wins_over_host_and_port() {
        assert_eq!(
            parse("host:2222 cookie: ABCDE").unwrap(),
            SwitchDecision::External {
                host: "host".into(),
                port: 2222,
                cookie: Some("ABCDE".into()),
                input: None,
                output: None,
            }
        );
    }

    #[test]
    fn mode_and_options() {
        assert_eq!(
            parse("NX mode: unencrypted options: foo").unwrap(),
            SwitchDecision::Internal {
                mode: Some(InternalMode::Unencrypted),
                options: Some("foo".into()),
            }
        );
    }

    #[test]
    fn options_run_until_quote() {
        let d = parse("NX mode: encrypted options: link=lan,cache=8M pack='x'").unwrap();
        assert_eq!(
            d,
            SwitchDecision::Internal {
                mode: None,
                options: Some("link=lan,cache=8M pack=".into()),
            }
        );
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert_eq!(
            parse("NX mode: bogus"),
            Err(ParseError::UnsupportedMode("bogus".into()))
        );
    }

    #[test]
    fn default_mode_collapses() {
        for word in ["default", "encrypted"] {
            assert_eq!(
                parse(&format!("NX mode: {word}")).unwrap(),
                SwitchDecision::Internal {
                    mode: None,
                    options: None
                }
            );
        }
    }

    #[test]
    fn options_alone_stop_at_whitespace() {
        assert_eq!(
            parse("NX options: a=1,b=2 trailing").unwrap(),
            SwitchDecision::Internal {
                mode: None,
                options: Some("a=1,b=2".into()),
            }
        );
    }

    #[test]
    fn numeric_host_and_port() {
        assert_eq!(
            parse("10.0.0.5:7777").unwrap(),
            SwitchDecision::External {
                host: "10.0.0.5".into(),
                port: 7777,
                cookie: None,
                input: None,
                output: None,
            }
        );
    }

    #[test]
    fn host_port_and_descriptors() {
        assert_eq!(
            parse("proxy.example:4000 in: 7 out: 8").unwrap(),
            SwitchDecision::External {
                host: "proxy.example".into(),
                port: 4000,
                cookie: None,
                input: Some(7),
                output: Some(8),
            }
        );
    }

    #[test]
    fn ssh_descriptors() {
        assert_eq!(
            parse("SSH in: 4 out: 5").unwrap(),
            SwitchDecision::ForwardDescriptors { input: 4, output: 5 }
        );
    }

    #[test]
    fn ssh_port_and_accept() {
        assert_eq!(
            parse("SSH port: 4022 accept: 192.168.1.9").unwrap(),
            SwitchDecision::ForwardPort {
                port: 4022,
                accept_host: "192.168.1.9".into(),
            }
        );
    }

    #[test]
    fn bare_specifier_any_case() {
        for word in ["NX", "nx", "Nx"] {
            assert_eq!(
                parse(word).unwrap(),
                SwitchDecision::Internal {
                    mode: None,
                    options: None
                }
            );
        }
    }

    #[test]
    fn empty_options_fall_back_to_specifier() {
        assert_eq!(
            parse("NX options: ").unwrap(),
            SwitchDecision::Internal {
                mode: None,
                options: None
            }
        );
    }

    #[test]
    fn specifier_reads_only_two_bytes() {
        for word in ["NXfoo", "nxagent"] {
            assert_eq!(
                parse(word).unwrap(),
                SwitchDecision::Internal {
                    mode: None,
                    options: None
                }
            );
        }
        assert_eq!(parse("N"), Err(ParseError::Unrecognized));
        assert_eq!(parse("XN"), Err(ParseError::Unrecognized));
    }

    #[test]
    fn options_keep_non_ascii_bytes() {
        let mut line = format!("{SWITCH_COMMAND}NX options: a=").into_bytes();
        line.push(0xE9);
        assert_eq!(
            parse_switch_command(&line).unwrap(),
            SwitchDecision::Internal {
                mode: None,
                options: Some(b"a=\xE9".to_vec()),
            }
        );
    }

    #[test]
    fn typed_fields_reject_non_ascii_bytes() {
        let mut line = format!("{SWITCH_COMMAND}NX mode: un").into_bytes();
        line.push(0xE9);
        assert_eq!(
            parse_switch_command(&line),
            Err(ParseError::UnsupportedMode("un\u{FFFD}".into()))
        );
    }

    #[test]
    fn port_out_of_range() {
        assert_eq!(
            parse("host:99999"),
            Err(ParseError::InvalidPort("99999".into()))
        );
    }

    #[test]
    fn port_width_is_five_digits() {
        // The sixth digit is trailing text and ignored.
        match parse("host:123456").unwrap() {
            SwitchDecision::External { port, .. } => assert_eq!(port, 12345),
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn garbage_is_unrecognized() {
        assert_eq!(parse("hello world"), Err(ParseError::Unrecognized));
        assert_eq!(
            parse_switch_command(b"not a switch command"),
            Err(ParseError::Unrecognized)
        );
    }

    #[test]
    fn length_limits() {
        assert_eq!(parse_switch_command(b""), Err(ParseError::Empty));
        let long = format!("{SWITCH_COMMAND}{}:22", "h".repeat(MAX_COMMAND_LEN));
        assert_eq!(
            parse_switch_command(long.as_bytes()),
            Err(ParseError::TooLong(long.len()))
        );
    }

    #[test]
    fn take_while_respects_width() {
        assert_eq!(
            take_while_max(b"12345678", 5, is_digit),
            (&b"12345"[..], &b"678"[..])
        );
        assert_eq!(take_while_max(b"12:3", 5, is_digit), (&b"12"[..], &b":3"[..]));
        assert_eq!(take_while_max(b"", 5, is_digit), (&b""[..], &b""[..]));
    }
}

//! Command grammar of the helper protocol.
//!
//! Commands are single-line strings with double-quoted arguments:
//!
//! ```text
//! FORMAT "<device>"
//! WRITE "<device>" "<source>"
//! CUSTOMIZE "<device>" "<cfg64>" "<cmdline64>" "<firstrun64>" "<cloudinit64>" "<cinet64>" "<fmt64>"
//! VERIFY "<device>" "<source>" "<hash64>"
//! SHUTDOWN
//! ```
//!
//! Parsing is tolerant: a regex fast path handles the common case of
//! arguments without embedded quotes (Windows paths full of backslashes
//! included); only arguments carrying `\"` escapes take the slower
//! backslash-aware tokenizer.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;

use crate::customize::Customization;
use crate::error::ImagerError;

/// A parsed helper command.
#[derive(Debug, Clone, PartialEq)]
pub enum HelperCommand {
    Format {
        device: String,
    },
    Write {
        device: String,
        source: String,
    },
    Customize {
        device: String,
        custom: Customization,
    },
    Verify {
        device: String,
        source: String,
        /// Hex digest, empty when the client did not supply one.
        expected_hash: String,
    },
    Shutdown,
}

fn two_arg_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^"([^"]*)"\s+"([^"]*)"$"#).expect("static regex"))
}

fn quoted_arg_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""([^"]*)""#).expect("static regex"))
}

/// Parse a command line into a [`HelperCommand`].
pub fn parse_command(line: &str) -> Result<HelperCommand, ImagerError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    match word {
        "SHUTDOWN" => {
            if rest.is_empty() {
                Ok(HelperCommand::Shutdown)
            } else {
                Err(ImagerError::InvalidCommand(
                    "SHUTDOWN takes no arguments".into(),
                ))
            }
        }
        "FORMAT" => {
            let args = parse_args(rest, 1)?;
            Ok(HelperCommand::Format {
                device: args[0].clone(),
            })
        }
        "WRITE" => {
            // Dedicated fast path for the most common command.
            if let Some(caps) = two_arg_regex().captures(rest) {
                return Ok(HelperCommand::Write {
                    device: caps[1].to_string(),
                    source: caps[2].to_string(),
                });
            }
            let args = parse_args(rest, 2)?;
            Ok(HelperCommand::Write {
                device: args[0].clone(),
                source: args[1].clone(),
            })
        }
        "VERIFY" => {
            let args = parse_args(rest, 3)?;
            Ok(HelperCommand::Verify {
                device: args[0].clone(),
                source: args[1].clone(),
                expected_hash: normalize_hash(&args[2])?,
            })
        }
        "CUSTOMIZE" => {
            let args = parse_args(rest, 7)?;
            Ok(HelperCommand::Customize {
                device: args[0].clone(),
                custom: Customization {
                    config: decode_text(&args[1])?,
                    cmdline: decode_text(&args[2])?,
                    firstrun: decode_text(&args[3])?,
                    cloudinit_user_data: decode_text(&args[4])?,
                    cloudinit_network: decode_text(&args[5])?,
                    init_format: decode_text(&args[6])?,
                },
            })
        }
        other => Err(ImagerError::InvalidCommand(format!(
            "unknown command {other:?}"
        ))),
    }
}

/// Extract exactly `expected` quoted arguments.
fn parse_args(rest: &str, expected: usize) -> Result<Vec<String>, ImagerError> {
    let args = if rest.contains("\\\"") {
        tokenize_quoted(rest)?
    } else {
        quoted_arg_regex()
            .captures_iter(rest)
            .map(|c| c[1].to_string())
            .collect()
    };

    if args.len() != expected {
        return Err(ImagerError::InvalidCommand(format!(
            "expected {expected} argument(s), found {}",
            args.len()
        )));
    }
    Ok(args)
}

/// Quote-and-backslash-aware tokenizer fallback.
fn tokenize_quoted(rest: &str) -> Result<Vec<String>, ImagerError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in rest.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => {
                if in_quotes {
                    args.push(std::mem::take(&mut current));
                }
                in_quotes = !in_quotes;
            }
            c if !in_quotes && c.is_whitespace() => {}
            c if in_quotes => current.push(c),
            c => {
                return Err(ImagerError::InvalidCommand(format!(
                    "unexpected {c:?} outside quotes"
                )))
            }
        }
    }
    if in_quotes || escaped {
        return Err(ImagerError::InvalidCommand(
            "unterminated quoted argument".into(),
        ));
    }
    Ok(args)
}

fn decode_text(b64: &str) -> Result<String, ImagerError> {
    if b64.is_empty() {
        return Ok(String::new());
    }
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| ImagerError::InvalidCommand(format!("bad base64 payload: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| ImagerError::InvalidCommand(format!("payload is not UTF-8: {e}")))
}

/// Normalize the expected-hash argument to a lowercase hex digest.
///
/// Clients may base64-wrap either the raw 32 digest bytes or the hex string.
fn normalize_hash(b64: &str) -> Result<String, ImagerError> {
    if b64.is_empty() {
        return Ok(String::new());
    }
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| ImagerError::InvalidCommand(format!("bad base64 hash: {e}")))?;

    if bytes.len() == 32 {
        return Ok(bytes.iter().map(|b| format!("{b:02x}")).collect());
    }

    let text = String::from_utf8(bytes)
        .map_err(|_| ImagerError::InvalidCommand("hash is neither raw nor hex".into()))?;
    let text = text.trim().to_ascii_lowercase();
    if text.len() == 64 && text.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(text)
    } else {
        Err(ImagerError::InvalidCommand(format!(
            "hash has unexpected shape ({} chars)",
            text.len()
        )))
    }
}

/// Quote an argument for a command line; the inverse of [`parse_args`].
pub fn quote_arg(arg: &str) -> String {
    if arg.contains('"') {
        let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    } else {
        format!("\"{arg}\"")
    }
}

//! Command line and envelope address parsing.

use once_cell::sync::Lazy;
use regex::Regex;

/// A single command line from the client, split into verb and argument.
///
/// The original line is retained because AUTH sub-steps carry base64
/// tokens whose case must not be folded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command verb, folded to upper case.
    pub verb: String,
    /// Everything after the first space, untrimmed. Empty if the line has
    /// no space.
    pub args: String,
    /// The full original line as read from the wire.
    pub orig: String,
}

impl Command {
    /// Splits a raw line into verb and argument remainder.
    pub fn parse(line: &str) -> Self {
        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, args),
            None => (line, ""),
        };
        Command {
            verb: verb.to_ascii_uppercase(),
            args: args.to_string(),
            orig: line.to_string(),
        }
    }
}

/// Failure to extract an envelope address from MAIL or RCPT arguments.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    /// The argument did not match the expected `From:<addr>` / `To:<addr>`
    /// shape. The engine reports the Display text back in a 550 reply.
    #[error("Invalid syntax in {verb} command")]
    InvalidSyntax {
        /// The verb whose argument failed to parse.
        verb: &'static str,
    },
}

// Lenient patterns tolerate whitespace between the colon and the angle
// bracket, which several real-world clients emit. The RFC patterns do not.
static MAIL_LENIENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)From:\s*<([^>]+)>").unwrap());
static MAIL_RFC: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)From:<([^>]+)>").unwrap());
static RCPT_LENIENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)To:\s*<([^>]+)>").unwrap());
static RCPT_RFC: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)To:<([^>]+)>").unwrap());

/// Returns the forward-path from a MAIL command argument.
pub fn parse_mail_args(args: &str, strict: bool) -> Result<String, ParseError> {
    let pattern = if strict { &MAIL_RFC } else { &MAIL_LENIENT };
    match pattern.captures(args) {
        Some(captures) => Ok(captures[1].to_string()),
        None => Err(ParseError::InvalidSyntax { verb: "MAIL" }),
    }
}

/// Returns the recipient path from a RCPT command argument.
pub fn parse_rcpt_args(args: &str, strict: bool) -> Result<String, ParseError> {
    let pattern = if strict { &RCPT_RFC } else { &RCPT_LENIENT };
    match pattern.captures(args) {
        Some(captures) => Ok(captures[1].to_string()),
        None => Err(ParseError::InvalidSyntax { verb: "RCPT" }),
    }
}

use crate::common::message::MailMessage;
use regex::Regex;
use std::sync::OnceLock;

/// Port the server listens on by default
pub const DEFAULT_PORT: u16 = 25;

/// Message delimiter per SMTP standard
pub const MSG_DELIMITER: &str = "\r\n";

/// Sent by the server as an initializing hello
pub const CODE_GREETING: u16 = 220;

/// Sent to acknowledge the end of a transmission channel
pub const CODE_CLOSING: u16 = 221;

/// Sent to acknowledge a request in the affirmative
pub const CODE_OKAY: u16 = 250;

/// Sent to tell the remote to start sending mail data
pub const CODE_START_MAIL_INPUT: u16 = 354;

/// Sent when an inbound command matches nothing we know
pub const CODE_UNKNOWN_COMMAND: u16 = 500;

/// Sent when a login is successful
pub const LOGIN_ACCEPTED: &str = "ACCEPTED";

/// Sent when a login is rejected because of a bad username/password combination
pub const LOGIN_DECLINED: &str = "DECLINED";

/// Mail sender envelope prefix
pub const MAIL_FROM_PREFIX: &str = "MAIL FROM:";

/// Mail recipient envelope prefix
pub const RCPT_TO_PREFIX: &str = "RCPT TO:";

/// Mail body content data header
pub const DATA_HEADER: &str = "DATA";

/// Main message body data terminator
pub const DATA_TERMINATOR: &str = ".";

/// First body line when the body crosses the wire substituted
pub const ENCRYPTED_MARKER: &str = "_ENCRYPTED_";

/// First body line when the body crosses the wire as-is
pub const PLAIN_MARKER: &str = "NOT-ENCRYPTED";

/// Fixed letter-rotation amount applied to substituted bodies
pub const SHIFT_AMOUNT: u8 = 13;

/// 220 greeting sent by the server once a connection is established
pub fn greeting(local_host: &str) -> String {
    format!("{} {} ESMTP", CODE_GREETING, local_host)
}

/// 250 acknowledgment of the client's HELO
pub fn hello_ack(remote_host: &str) -> String {
    format!("{} Hello {}, I am glad to meet you", CODE_OKAY, remote_host)
}

/// 250 acknowledgment of an envelope line or a completed body
pub fn ok_reply() -> String {
    format!("{} OK", CODE_OKAY)
}

/// 354 go-ahead sent in response to DATA
pub fn end_data_with() -> String {
    format!(
        "{} End data with <CR><LF> {}<CR><LF>",
        CODE_START_MAIL_INPUT, DATA_TERMINATOR
    )
}

/// 221 farewell sent in response to QUIT
pub fn farewell(local_host: &str) -> String {
    format!(
        "{} {} Service closing transmission channel",
        CODE_CLOSING, local_host
    )
}

/// 500 reply for commands that match no dispatch entry
pub fn unknown_command() -> String {
    format!("{} Syntax error, command unrecognized", CODE_UNKNOWN_COMMAND)
}

/// Formats the sender address as a MAIL FROM envelope line
pub fn mail_from_line(sender: &str) -> String {
    format!("{}<{}>", MAIL_FROM_PREFIX, sender)
}

/// Formats every non-empty to/cc recipient as a RCPT TO envelope line, in order
pub fn rcpt_to_lines(to: &[String], cc: &[String]) -> Vec<String> {
    to.iter()
        .chain(cc.iter())
        .filter(|addr| !addr.is_empty())
        .map(|addr| format!("{}<{}>", RCPT_TO_PREFIX, addr))
        .collect()
}

/// Pulls the address out of an envelope line such as `RCPT TO:<user@host>`
///
/// Falls back to everything after the first colon when the brackets are absent.
pub fn envelope_address(line: &str) -> String {
    if let (Some(open), Some(close)) = (line.find('<'), line.rfind('>')) {
        if open < close {
            return line[open + 1..close].to_string();
        }
    }

    match line.find(':') {
        Some(pos) => line[pos + 1..].trim().to_string(),
        None => String::new(),
    }
}

/// Breaks up the message and details into the proper body line sequence
///
/// One marker line, the five header lines, a blank separator, then the body
/// split on newlines. Substituted messages have every line but the marker
/// shifted before they cross the wire.
pub fn format_body_for_send(mail: &MailMessage) -> Vec<String> {
    let mut lines = Vec::new();

    let marker = if mail.encrypted {
        ENCRYPTED_MARKER
    } else {
        PLAIN_MARKER
    };
    lines.push(marker.to_string());
    lines.push(format!("From: {}", mail.sender));
    lines.push(format_address_line("To: ", &mail.to));
    lines.push(format_address_line("Cc: ", &mail.cc));
    lines.push(format!("Date: {}", mail.date));
    lines.push(format!("Subject: {}", mail.subject));
    lines.push(String::new());
    lines.extend(mail.body.split('\n').map(|s| s.to_string()));

    if mail.encrypted {
        lines = caesar_shift(&lines, SHIFT_AMOUNT);
    }

    lines
}

/// Builds the To: and Cc: body lines with their prefix and comma-joined addresses
fn format_address_line(prefix: &str, addresses: &[String]) -> String {
    format!("{}{}", prefix, addresses.join(", "))
}

/// Applies a fixed-shift letter rotation to the given lines
///
/// Only ASCII letters rotate, case is preserved, everything else passes
/// through untouched. The `_ENCRYPTED_` marker line is never shifted.
/// Reversal is `26 - shift`.
pub fn caesar_shift(lines: &[String], shift: u8) -> Vec<String> {
    lines
        .iter()
        .map(|line| {
            if line == ENCRYPTED_MARKER {
                line.clone()
            } else {
                shift_line(line, shift)
            }
        })
        .collect()
}

/// Rotates the letters of a single line
fn shift_line(line: &str, shift: u8) -> String {
    line.chars()
        .map(|c| {
            if c.is_ascii_lowercase() {
                (((c as u8 - b'a' + shift) % 26) + b'a') as char
            } else if c.is_ascii_uppercase() {
                (((c as u8 - b'A' + shift) % 26) + b'A') as char
            } else {
                c
            }
        })
        .collect()
}

/// Regex used to find email addresses in header lines
fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new("[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+").expect("address pattern is valid")
    })
}

/// Returns every non-overlapping address match in the source, in order
pub fn extract_addresses(source: &str) -> Vec<String> {
    address_pattern()
        .find_iter(source)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Encodes a line as ISO-8859-1 bytes
///
/// Characters outside the Latin-1 range are sent as `?`.
pub fn latin1_encode(line: &str) -> Vec<u8> {
    line.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
        .collect()
}

/// Decodes ISO-8859-1 bytes into a string
pub fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

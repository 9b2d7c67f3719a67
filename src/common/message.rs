use crate::common::codec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A composed or received email
///
/// Addresses are free-form strings; only the `user@host` split is ever
/// interpreted, and only at routing time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    /// Whether the body crosses the wire letter-substituted
    pub encrypted: bool,
    /// Sender's address
    pub sender: String,
    /// "To" recipients, in order
    pub to: Vec<String>,
    /// "Cc" recipients, in order
    pub cc: Vec<String>,
    /// Display date string
    pub date: String,
    /// Message subject
    pub subject: String,
    /// Message contents, may contain newlines
    pub body: String,
}

impl fmt::Display for MailMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Encrypted: {}", self.encrypted)?;
        writeln!(f, "From: {}", self.sender)?;
        writeln!(f, "To: [{}]", self.to.join(", "))?;
        writeln!(f, "Cc: [{}]", self.cc.join(", "))?;
        writeln!(f, "Date: {}", self.date)?;
        writeln!(f, "Subject: {}", self.subject)?;
        writeln!(f, "Body:")?;
        writeln!(f, "{}", self.body)
    }
}

/// An email carrying its wire envelope
///
/// The envelope addresses drive routing and need not equal the display
/// To/Cc lists inside the body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmtpMailMessage {
    /// The display message parsed out of the body
    pub mail: MailMessage,
    /// Address taken from the MAIL FROM line
    pub smtp_from: String,
    /// Addresses taken from the RCPT TO lines, in order
    pub smtp_recipients: Vec<String>,
}

impl SmtpMailMessage {
    /// Builds a message from the raw body lines read off the wire
    ///
    /// `contents` holds every line after the encryption marker, already
    /// reverse-substituted when the marker said so. The first five lines are
    /// the header block; the display body keeps all content lines, each
    /// newline-terminated.
    pub fn from_wire(
        encrypted: bool,
        smtp_from: String,
        smtp_recipients: Vec<String>,
        contents: Vec<String>,
    ) -> Self {
        let header = |idx: usize, prefix: &str| -> String {
            let line = contents.get(idx).map(String::as_str).unwrap_or("");
            line.strip_prefix(prefix).unwrap_or(line).to_string()
        };

        let sender = codec::extract_addresses(&header(0, "From: "))
            .into_iter()
            .next()
            .unwrap_or_default();
        let to = codec::extract_addresses(&header(1, "To: "));
        let cc = codec::extract_addresses(&header(2, "Cc: "));
        let date = header(3, "Date: ");
        let subject = header(4, "Subject: ");

        let mut body = String::new();
        for line in &contents {
            body.push_str(line);
            body.push('\n');
        }

        Self {
            mail: MailMessage {
                encrypted,
                sender,
                to,
                cc,
                date,
                subject,
                body,
            },
            smtp_from,
            smtp_recipients,
        }
    }
}

impl fmt::Display for SmtpMailMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SMTP From: {}", self.smtp_from)?;
        writeln!(f, "SMTP Recip: [{}]", self.smtp_recipients.join(", "))?;
        write!(f, "{}", self.mail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_contents() -> Vec<String> {
        [
            "From: alice@srv.example",
            "To: bob@srv.example, carol@other.example",
            "Cc: ",
            "Date: 2024-01-02",
            "Subject: Hi",
            "",
            "hello",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[test]
    fn test_from_wire_extracts_headers() {
        let msg = SmtpMailMessage::from_wire(
            false,
            "alice@srv.example".to_string(),
            vec!["bob@srv.example".to_string()],
            wire_contents(),
        );

        assert_eq!(msg.mail.sender, "alice@srv.example");
        assert_eq!(msg.mail.to, vec!["bob@srv.example", "carol@other.example"]);
        assert!(msg.mail.cc.is_empty());
        assert_eq!(msg.mail.date, "2024-01-02");
        assert_eq!(msg.mail.subject, "Hi");
    }

    #[test]
    fn test_from_wire_body_keeps_header_block() {
        let msg = SmtpMailMessage::from_wire(
            false,
            "alice@srv.example".to_string(),
            vec!["bob@srv.example".to_string()],
            wire_contents(),
        );

        assert!(msg.mail.body.starts_with("From: alice@srv.example\n"));
        assert!(msg.mail.body.ends_with("hello\n"));
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let mut mail = MailMessage::default();
        mail.sender = "alice@srv".to_string();
        mail.to = vec!["bob@srv".to_string()];
        mail.cc = vec!["carol@srv".to_string()];
        mail.date = "2024-01-02".to_string();
        mail.subject = "Hi".to_string();
        mail.body = "line one\nline two".to_string();

        // the marker line is consumed by the reader before body collection
        let wire = codec::format_body_for_send(&mail);
        let contents: Vec<String> = wire[1..].to_vec();

        let recipients: Vec<String> = codec::rcpt_to_lines(&mail.to, &mail.cc)
            .iter()
            .map(|l| codec::envelope_address(l))
            .collect();
        assert_eq!(recipients, vec!["bob@srv", "carol@srv"]);

        let parsed = SmtpMailMessage::from_wire(
            false,
            codec::envelope_address(&codec::mail_from_line(&mail.sender)),
            recipients,
            contents,
        );

        assert_eq!(parsed.smtp_from, "alice@srv");
        assert_eq!(parsed.mail.sender, mail.sender);
        assert_eq!(parsed.mail.to, mail.to);
        assert_eq!(parsed.mail.cc, mail.cc);
        assert_eq!(parsed.mail.date, mail.date);
        assert_eq!(parsed.mail.subject, mail.subject);
        assert!(parsed.mail.body.ends_with("line one\nline two\n"));
    }

    #[test]
    fn test_short_body_tolerated() {
        let msg = SmtpMailMessage::from_wire(
            false,
            "a@h".to_string(),
            vec!["b@h".to_string()],
            vec!["From: a@h".to_string()],
        );
        assert_eq!(msg.mail.sender, "a@h");
        assert!(msg.mail.subject.is_empty());
        assert_eq!(msg.mail.body, "From: a@h\n");
    }

    #[test]
    fn test_display_rendering() {
        let mut mail = MailMessage::default();
        mail.sender = "a@h".to_string();
        mail.to = vec!["b@h".to_string(), "c@h".to_string()];
        mail.subject = "s".to_string();
        mail.body = "text".to_string();

        let rendered = mail.to_string();
        assert!(rendered.starts_with("Encrypted: false\nFrom: a@h\nTo: [b@h, c@h]\nCc: []\n"));
        assert!(rendered.ends_with("Body:\ntext\n"));
    }
}

//! Topic frame codec and parameter escaping.
//!
//! Outbound frame format:
//! ```text
//! ┌──────┬──────┬─────────────┬──────────┬─────┬──────────────┬──────┐
//! │ 0x00 │ 0x83 │ len (2B BE) │ 0x00 × 4 │ '?' │ param string │ 0x00 │
//! └──────┴──────┴─────────────┴──────────┴─────┴──────────────┴──────┘
//! ```
//! Length = total frame bytes minus 4, and must fit in 16 bits.
//!
//! Replies reuse the same four-byte header followed by a one-byte reply
//! type, the payload, and a trailing NUL.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::{Error, Result};

/// Marker written at byte offset 1 of every topic frame and reply.
pub const TOPIC_TAG: u8 = 0x83;
/// Zero bytes preceding the `'?'` of a topic frame.
pub const TOPIC_PREAMBLE_LEN: usize = 8;
/// Reply type byte used for string replies.
pub const REPLY_STRING: u8 = 0x06;
/// Width, in characters, of the reply-type prefix stripped from decoded replies.
pub const REPLY_PREFIX_CHARS: usize = 5;

pub const SECRET_PARAM: &str = "secret";
pub const COMMAND_PARAM: &str = "command";

// =============================================================================
// Parameter escaping
// =============================================================================

const ESCAPES: [(char, &str); 5] = [
    ('%', "%25"),
    ('=', "%3d"),
    (';', "%3b"),
    ('&', "%26"),
    ('+', "%2b"),
];

/// Percent-escape the characters that delimit a parameter string.
pub fn escape_param(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match ESCAPES.iter().find(|(raw, _)| *raw == c) {
            Some((_, escaped)) => out.push_str(escaped),
            None => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_param`]. Unknown `%xx` sequences are left untouched.
pub fn unescape_param(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let decoded = tail.get(..3).and_then(|seq| {
            ESCAPES
                .iter()
                .find(|(_, escaped)| escaped.eq_ignore_ascii_case(seq))
                .map(|(raw, _)| *raw)
        });
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[3..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Join `key=value` pairs with `;`, escaping values.
pub fn build_param_string<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, escape_param(v)))
        .collect::<Vec<_>>()
        .join(";")
}

/// Split a parameter string back into unescaped `(key, value)` pairs.
pub fn parse_param_string(params: &str) -> Vec<(String, String)> {
    params
        .split(';')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (unescape_param(k), unescape_param(v)),
            None => (unescape_param(pair), String::new()),
        })
        .collect()
}

// =============================================================================
// Commands
// =============================================================================

/// Closed set of commands the warden sends to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicCommand {
    /// Restart at the next natural reboot point.
    GracefulRestart,
    /// Exit at the next natural reboot point.
    GracefulShutdown,
    /// Acknowledge a compatible API version report.
    ApiCompatible { version: String },
    /// A new build is live and will be picked up on reboot.
    DeploymentStaged { revision: String },
    /// Relay a chat line into the game.
    ChatMessage { message: String },
    /// Pre-built parameter string sent verbatim, with only the secret added.
    Raw(String),
}

impl TopicCommand {
    /// Wire name of the command, `None` for raw pass-through.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            TopicCommand::GracefulRestart => Some("graceful_restart"),
            TopicCommand::GracefulShutdown => Some("graceful_shutdown"),
            TopicCommand::ApiCompatible { .. } => Some("api_compat"),
            TopicCommand::DeploymentStaged { .. } => Some("deployment_staged"),
            TopicCommand::ChatMessage { .. } => Some("chat_message"),
            TopicCommand::Raw(_) => None,
        }
    }

    /// Render the full parameter string for this command.
    pub fn to_params(&self, secret: &str) -> String {
        if let TopicCommand::Raw(raw) = self {
            let secret_pair = build_param_string([(SECRET_PARAM, secret)]);
            return if raw.is_empty() {
                secret_pair
            } else {
                format!("{};{}", raw, secret_pair)
            };
        }

        let name = self.name().unwrap_or_default();
        let mut pairs: Vec<(&str, &str)> = vec![(SECRET_PARAM, secret), (COMMAND_PARAM, name)];
        match self {
            TopicCommand::ApiCompatible { version } => pairs.push(("version", version)),
            TopicCommand::DeploymentStaged { revision } => pairs.push(("revision", revision)),
            TopicCommand::ChatMessage { message } => pairs.push(("message", message)),
            _ => {}
        }
        build_param_string(pairs)
    }
}

// =============================================================================
// Framing
// =============================================================================

fn write_length(buf: &mut BytesMut) -> Result<()> {
    let declared = buf.len() - 4;
    let declared = u16::try_from(declared).map_err(|_| {
        Error::validation(format!(
            "topic frame too large: {} bytes exceeds the 16-bit length field",
            declared
        ))
    })?;
    buf[1] = TOPIC_TAG;
    buf[2..4].copy_from_slice(&declared.to_be_bytes());
    Ok(())
}

/// Build the bit-exact frame for a parameter string.
pub fn encode_topic_frame(params: &str) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(TOPIC_PREAMBLE_LEN + params.len() + 2);
    buf.put_bytes(0, TOPIC_PREAMBLE_LEN);
    buf.put_u8(b'?');
    buf.put_slice(params.as_bytes());
    buf.put_u8(0);
    write_length(&mut buf)?;
    Ok(buf.freeze())
}

/// Extract the parameter string from a topic frame.
pub fn decode_topic_frame(frame: &[u8]) -> Result<String> {
    if frame.len() < TOPIC_PREAMBLE_LEN + 2 || frame[1] != TOPIC_TAG {
        return Err(Error::protocol("not a topic frame"));
    }
    let declared = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if declared + 4 != frame.len() {
        return Err(Error::protocol(format!(
            "topic frame length mismatch: header says {}, got {}",
            declared + 4,
            frame.len()
        )));
    }
    let body = &frame[TOPIC_PREAMBLE_LEN..];
    if body.first() != Some(&b'?') {
        return Err(Error::protocol("topic frame missing '?' marker"));
    }
    let params = body[1..].strip_suffix(&[0]).unwrap_or(&body[1..]);
    Ok(String::from_utf8_lossy(params).into_owned())
}

/// Build a string reply the way the engine answers a topic call.
pub fn encode_reply(text: &str) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(text.len() + 6);
    buf.put_bytes(0, 4);
    buf.put_u8(REPLY_STRING);
    buf.put_slice(text.as_bytes());
    buf.put_u8(0);
    write_length(&mut buf)?;
    Ok(buf.freeze())
}

/// Total reply size announced by a reply header, if `buf` holds one.
pub fn declared_reply_len(buf: &[u8]) -> Option<usize> {
    if buf.len() >= 4 && buf[1] == TOPIC_TAG {
        Some(u16::from_be_bytes([buf[2], buf[3]]) as usize + 4)
    } else {
        None
    }
}

/// Turn raw reply bytes into the result string.
///
/// Trailing NULs and whitespace are stripped; decoded text longer than the
/// reply-type prefix loses that prefix.
pub fn decode_reply(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
    if trimmed.chars().count() > REPLY_PREFIX_CHARS {
        trimmed.chars().skip(REPLY_PREFIX_CHARS).collect()
    } else {
        trimmed.to_string()
    }
}

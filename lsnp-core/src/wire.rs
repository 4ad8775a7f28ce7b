//! Text codec: one `KEY: value` line per field, terminated by a blank line.
//! One message per datagram; there is no length prefix and no escaping.
//! The decoder trims keys and values, so the encoder refuses any whose ends are whitespace.

use crate::protocol::{field, MessageKind, MAX_DATAGRAM_LEN};

const SEPARATOR: &str = ": ";
const TERMINATOR: &str = "\n\n";

/// One decoded protocol message: the `TYPE` discriminant plus the remaining
/// fields in insertion order. Keys are unique and case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    kind: MessageKind,
    fields: Vec<(String, String)>,
}

impl Envelope {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            fields: Vec::new(),
        }
    }

    /// Builder form of [`Envelope::set`].
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// Insert a field, or replace its value in place if the key already exists.
    pub fn set(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        if key == field::TYPE {
            self.kind = MessageKind::parse(&value);
            return;
        }
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Field value, treating an empty string as absent.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn message_id(&self) -> Option<&str> {
        self.non_empty(field::MESSAGE_ID)
    }

    /// Claimed sender identity. Revisions of the protocol use `FROM`, `USER_ID` or `USER`.
    pub fn sender(&self) -> Option<&str> {
        self.non_empty(field::FROM)
            .or_else(|| self.non_empty(field::USER_ID))
            .or_else(|| self.non_empty(field::USER))
    }

    pub fn recipient(&self) -> Option<&str> {
        self.non_empty(field::TO)
    }

    pub fn token(&self) -> Option<&str> {
        self.non_empty(field::TOKEN)
    }

    pub fn file_id(&self) -> Option<&str> {
        self.non_empty(field::FILEID)
    }
}

/// Render an envelope: `TYPE` first, then every field in insertion order, then a blank line.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let mut out = String::new();
    push_line(&mut out, field::TYPE, envelope.kind.as_str())?;
    for (key, value) in &envelope.fields {
        push_line(&mut out, key, value)?;
    }
    // The last line already ends in one newline; one more makes the blank terminator.
    out.push('\n');
    debug_assert!(out.ends_with(TERMINATOR));
    if out.len() > MAX_DATAGRAM_LEN {
        return Err(EncodeError::TooLarge(out.len()));
    }
    Ok(out.into_bytes())
}

fn push_line(out: &mut String, key: &str, value: &str) -> Result<(), EncodeError> {
    if key.is_empty() || key.contains(SEPARATOR) || has_line_break(key) || key.trim() != key {
        return Err(EncodeError::InvalidKey(key.to_string()));
    }
    if has_line_break(value) || value.trim() != value {
        return Err(EncodeError::InvalidValue(key.to_string()));
    }
    out.push_str(key);
    out.push_str(SEPARATOR);
    out.push_str(value);
    out.push('\n');
    Ok(())
}

fn has_line_break(s: &str) -> bool {
    s.contains('\n') || s.contains('\r')
}

/// Lenient field parse: every line containing `": "` yields a trimmed key/value pair,
/// anything else is skipped. A repeated key keeps its first position and its last value.
pub fn decode_fields(bytes: &[u8]) -> Result<Vec<(String, String)>, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once(SEPARATOR) else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => fields.push((key.to_string(), value.to_string())),
        }
    }
    Ok(fields)
}

/// Decode one datagram. Only a missing `TYPE` (or non-UTF-8 input) is an error;
/// validating the other fields is up to the caller.
pub fn decode_envelope(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let mut fields = decode_fields(bytes)?;
    let pos = fields
        .iter()
        .position(|(k, v)| k == field::TYPE && !v.is_empty())
        .ok_or(DecodeError::MissingType)?;
    let (_, tag) = fields.remove(pos);
    Ok(Envelope {
        kind: MessageKind::parse(&tag),
        fields,
    })
}

/// Error rendering an envelope that the wire format cannot represent.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("field key {0:?} cannot be represented on the wire")]
    InvalidKey(String),
    #[error("value of field {0} contains a line break or surrounding whitespace")]
    InvalidValue(String),
    #[error("encoded message is {0} bytes, larger than one datagram")]
    TooLarge(usize),
}

/// Error decoding a datagram into an envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("datagram is not valid UTF-8")]
    InvalidUtf8,
    #[error("message has no TYPE field")]
    MissingType,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dm() -> Envelope {
        Envelope::new(MessageKind::Dm)
            .with(field::FROM, "alice@10.0.0.5")
            .with(field::TO, "bob@10.0.0.6")
            .with(field::CONTENT, "hello: there")
            .with(field::MESSAGE_ID, "00ff00ff00ff00ff")
    }

    #[test]
    fn encodes_type_first_and_blank_line_terminator() {
        let bytes = encode_envelope(&sample_dm()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("TYPE: DM\nFROM: alice@10.0.0.5\n"));
        assert!(text.ends_with("MESSAGE_ID: 00ff00ff00ff00ff\n\n"));
    }

    #[test]
    fn roundtrip_preserves_order_and_values() {
        let env = sample_dm();
        let decoded = decode_envelope(&encode_envelope(&env).unwrap()).unwrap();
        assert_eq!(decoded, env);
        let keys: Vec<&str> = decoded.fields().map(|(k, _)| k).collect();
        assert_eq!(keys, ["FROM", "TO", "CONTENT", "MESSAGE_ID"]);
    }

    #[test]
    fn roundtrip_edge_values() {
        let envelopes = [
            Envelope::new(MessageKind::FileOffer)
                .with(field::FILEID, "f1")
                .with(field::DESCRIPTION, "")
                .with(field::FILENAME, "a b.txt"),
            Envelope::new(MessageKind::Post)
                .with(field::CONTENT, "key: value: more")
                .with(field::FROM, "alice@10.0.0.5"),
            Envelope::new(MessageKind::Post)
                .with(field::FROM, "alice@10.0.0.5")
                .with(field::CONTENT, "::"),
            Envelope::new(MessageKind::Ping),
        ];
        for env in envelopes {
            let decoded = decode_envelope(&encode_envelope(&env).unwrap()).unwrap();
            assert_eq!(decoded, env);
        }
    }

    #[test]
    fn padded_values_are_refused() {
        for value in [" lead", "trail ", "\tx"] {
            let env = Envelope::new(MessageKind::Post).with(field::CONTENT, value);
            assert!(matches!(
                encode_envelope(&env),
                Err(EncodeError::InvalidValue(_))
            ));
        }
        let env = Envelope::new(MessageKind::Post).with(" CONTENT", "x");
        assert!(matches!(encode_envelope(&env), Err(EncodeError::InvalidKey(_))));
    }

    #[test]
    fn lenient_decode_skips_garbage_lines() {
        let raw = b"TYPE: PING\nnot a field\nUSER_ID:  bob@10.0.0.6  \n:\n\n";
        let env = decode_envelope(raw).unwrap();
        assert_eq!(env.kind(), &MessageKind::Ping);
        assert_eq!(env.get(field::USER_ID), Some("bob@10.0.0.6"));
        assert_eq!(env.fields().count(), 1);
    }

    #[test]
    fn crlf_lines_are_accepted() {
        let env = decode_envelope(b"TYPE: ACK\r\nMESSAGE_ID: abc\r\n\r\n").unwrap();
        assert_eq!(env.kind(), &MessageKind::Ack);
        assert_eq!(env.message_id(), Some("abc"));
    }

    #[test]
    fn missing_type_is_rejected() {
        assert!(matches!(
            decode_envelope(b"FROM: alice@10.0.0.5\n\n"),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            decode_envelope(b"TYPE: \n\n"),
            Err(DecodeError::MissingType)
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(matches!(
            decode_envelope(&[0xff, 0xfe, b'\n']),
            Err(DecodeError::InvalidUtf8)
        ));
    }

    #[test]
    fn repeated_key_keeps_last_value() {
        let env = decode_envelope(b"TYPE: POST\nCONTENT: one\nCONTENT: two\n\n").unwrap();
        assert_eq!(env.get(field::CONTENT), Some("two"));
        assert_eq!(env.fields().count(), 1);
    }

    #[test]
    fn line_breaks_in_values_are_refused() {
        let env = Envelope::new(MessageKind::Post).with(field::CONTENT, "two\nlines");
        assert!(matches!(
            encode_envelope(&env),
            Err(EncodeError::InvalidValue(_))
        ));
    }

    #[test]
    fn oversized_message_is_refused() {
        let env = Envelope::new(MessageKind::Post).with(field::CONTENT, "x".repeat(MAX_DATAGRAM_LEN));
        assert!(matches!(encode_envelope(&env), Err(EncodeError::TooLarge(_))));
    }

    #[test]
    fn setting_type_changes_kind() {
        let mut env = Envelope::new(MessageKind::Post);
        env.set(field::TYPE, "LIKE");
        assert_eq!(env.kind(), &MessageKind::Like);
        assert_eq!(env.fields().count(), 0);
    }
}

use crate::protocol::{DM_MARKER, SERVER_PREFIX};

/// One inbound line after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Opaque chat line relayed verbatim to everyone but the sender.
    Group { sender: String, body: String },
    /// Already-formatted system text, relayed verbatim without re-wrapping.
    ServerText(String),
    Private {
        sender: String,
        recipient: String,
        body: String,
    },
    /// A private message with no `recipient:` delimiter.
    Malformed,
}

/// Classifies a line read from the session bound to `sender`.
pub fn classify(sender: &str, line: &str) -> Inbound {
    if let Some(payload) = line.strip_prefix(DM_MARKER) {
        return match payload.split_once(':') {
            Some((recipient, body)) if !recipient.trim().is_empty() => Inbound::Private {
                sender: sender.to_string(),
                recipient: recipient.trim().to_string(),
                body: body.trim().to_string(),
            },
            _ => Inbound::Malformed,
        };
    }

    if line.starts_with(SERVER_PREFIX) {
        return Inbound::ServerText(line.to_string());
    }

    Inbound::Group {
        sender: sender.to_string(),
        body: line.to_string(),
    }
}

use chatflow_core::types::{MessageType, OutgoingMessage};

/// Render an outgoing message for a plain-text transport.
///
/// Menu options are listed one per line and numbered from 1, which is also
/// how the menu matcher accepts numeric replies.
pub fn render_plain(message: &OutgoingMessage) -> String {
    let mut out = message.content.clone();
    match message.message_type {
        MessageType::Text => {}
        MessageType::Options => {
            for (i, option) in message.options.iter().enumerate() {
                push_line(&mut out, &format!("{}. {}", i + 1, option));
            }
        }
        MessageType::Media | MessageType::Audio => {
            if let Some(media) = &message.media {
                let label = if message.message_type == MessageType::Audio {
                    "audio"
                } else {
                    "media"
                };
                push_line(&mut out, &format!("[{}] {}", label, media.url));
            }
        }
    }
    out
}

fn push_line(out: &mut String, line: &str) {
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::types::{ContactId, MediaRef};

    fn message(kind: MessageType, content: &str) -> OutgoingMessage {
        let mut m = OutgoingMessage::text(&ContactId::from_str("c1"), "console", content);
        m.message_type = kind;
        m
    }

    #[test]
    fn text_unchanged() {
        assert_eq!(render_plain(&message(MessageType::Text, "Hi")), "Hi");
    }

    #[test]
    fn options_are_numbered() {
        let mut m = message(MessageType::Options, "How can we help?");
        m.options = vec!["Support".into(), "Sales".into()];
        assert_eq!(render_plain(&m), "How can we help?\n1. Support\n2. Sales");
    }

    #[test]
    fn audio_without_caption() {
        let mut m = message(MessageType::Audio, "");
        m.media = Some(MediaRef {
            url: "https://cdn.example.com/a.mp3".into(),
            mime_type: Some("audio/mpeg".into()),
        });
        assert_eq!(render_plain(&m), "[audio] https://cdn.example.com/a.mp3");
    }
}

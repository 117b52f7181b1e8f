//! Prompt formatting, trigger matching and outbound routing.

use std::sync::{Arc, LazyLock};

use anyhow::anyhow;
use futures::future::BoxFuture;
use hearth_core::model::{NewMessage, RegisteredGroup};
use regex::Regex;
use tracing::warn;

use crate::channel::Channel;
use crate::ipc::IpcDelegate;

static INTERNAL_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<internal>.*?</internal>").expect("valid internal-block regex"));

/// Normalizes a configured trigger to `@name`. Blank input means no trigger.
pub fn normalize_trigger(raw: &str) -> Option<String> {
    let name = raw.trim().trim_start_matches('@').trim();
    if name.is_empty() {
        None
    } else {
        Some(format!("@{name}"))
    }
}

/// Case-insensitive match of `trigger` at the start of a message, ending on
/// a word boundary.
pub fn trigger_regex(trigger: &str) -> Option<Regex> {
    let escaped = regex::escape(trigger);
    match Regex::new(&format!(r"(?i)^{escaped}\b")) {
        Ok(re) => Some(re),
        Err(err) => {
            warn!(trigger, err = %err, "trigger does not compile, ignoring it");
            None
        }
    }
}

/// Whether `content` would wake the agent for `group`.
pub fn matches_trigger(group: &RegisteredGroup, content: &str) -> bool {
    if group.is_primary {
        return true;
    }
    let Some(trigger) = group.trigger.as_deref() else {
        return true;
    };
    trigger_regex(trigger).is_some_and(|re| re.is_match(content.trim()))
}

/// Whether any message in the batch carries the trigger.
pub fn batch_triggers(group: &RegisteredGroup, messages: &[NewMessage]) -> bool {
    messages.iter().any(|m| matches_trigger(group, &m.content))
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders a batch as the XML envelope the agent reads.
pub fn format_messages(messages: &[NewMessage]) -> String {
    let mut out = String::from("<messages>\n");
    for m in messages {
        out.push_str(&format!(
            "<message sender=\"{}\" time=\"{}\">{}</message>\n",
            escape_xml(&m.sender_name),
            escape_xml(&m.timestamp),
            escape_xml(&m.content)
        ));
    }
    out.push_str("</messages>");
    out
}

/// Removes `<internal>...</internal>` reasoning blocks and trims the rest.
pub fn strip_internal_tags(text: &str) -> String {
    INTERNAL_BLOCK.replace_all(text, "").trim().to_string()
}

/// Text to deliver for an agent result, or `None` when nothing visible remains.
pub fn format_outbound(raw: &str, prefix_name: Option<&str>) -> Option<String> {
    let text = strip_internal_tags(raw);
    if text.is_empty() {
        return None;
    }
    Some(match prefix_name {
        Some(name) => format!("{name}: {text}"),
        None => text,
    })
}

// ---------------------------------------------------------------------------
// Outbound routing
// ---------------------------------------------------------------------------

/// Routes outbound traffic to the first channel that owns the address.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    channels: Vec<Arc<dyn Channel>>,
}

impl ChannelRouter {
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> &[Arc<dyn Channel>] {
        &self.channels
    }

    pub fn find(&self, address: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.iter().find(|c| c.owns_address(address))
    }

    pub async fn send(&self, address: &str, text: &str) -> anyhow::Result<()> {
        let channel = self
            .find(address)
            .ok_or_else(|| anyhow!("no channel owns address {address}"))?;
        channel.send_message(address, text).await
    }

    /// Best effort; failures are logged.
    pub async fn set_typing(&self, address: &str, typing: bool) {
        let Some(channel) = self.find(address) else {
            return;
        };
        if let Err(err) = channel.set_typing(address, typing).await {
            warn!(address, channel = channel.name(), err = %err, "failed to set typing");
        }
    }
}

impl IpcDelegate for ChannelRouter {
    fn send_message<'a>(&'a self, chat_jid: &'a str, text: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(self.send(chat_jid, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{InboundHandler, LogChannel};
    use hearth_core::model::SandboxConfig;
    use std::sync::Mutex;

    fn group(trigger: Option<&str>, is_primary: bool) -> RegisteredGroup {
        RegisteredGroup {
            jid: "http:team".into(),
            name: "Team".into(),
            folder: "team".into(),
            trigger: trigger.map(String::from),
            added_at: "2026-01-01T00:00:00.000Z".into(),
            sandbox: SandboxConfig::default(),
            is_primary,
        }
    }

    fn message(sender: &str, content: &str) -> NewMessage {
        NewMessage {
            id: "1".into(),
            chat_jid: "http:team".into(),
            sender: "u1".into(),
            sender_name: sender.into(),
            content: content.into(),
            timestamp: "2026-01-15T12:00:00.000Z".into(),
            is_from_me: false,
            is_bot_message: false,
        }
    }

    #[test]
    fn trigger_normalization() {
        assert_eq!(normalize_trigger("Andy").as_deref(), Some("@Andy"));
        assert_eq!(normalize_trigger("  @bot ").as_deref(), Some("@bot"));
        assert_eq!(normalize_trigger("   "), None);
        assert_eq!(normalize_trigger("@"), None);
    }

    #[test]
    fn trigger_is_anchored_and_case_insensitive() {
        let g = group(Some("@Andy"), false);
        assert!(matches_trigger(&g, "@Andy hello"));
        assert!(matches_trigger(&g, "  @andy, are you there?"));
        assert!(!matches_trigger(&g, "hello @Andy"));
        assert!(!matches_trigger(&g, "@Andyman hi"));
    }

    #[test]
    fn primary_and_triggerless_groups_always_match() {
        assert!(matches_trigger(&group(Some("@Andy"), true), "anything"));
        assert!(matches_trigger(&group(None, false), "anything"));
        let g = group(Some("@Andy"), false);
        assert!(batch_triggers(&g, &[message("A", "hi"), message("B", "@andy ping")]));
        assert!(!batch_triggers(&g, &[message("A", "hi")]));
    }

    #[test]
    fn format_messages_escapes() {
        let out = format_messages(&[message("Al \"the\" <pal>", "a & b < c")]);
        assert_eq!(
            out,
            "<messages>\n<message sender=\"Al &quot;the&quot; &lt;pal&gt;\" time=\"2026-01-15T12:00:00.000Z\">a &amp; b &lt; c</message>\n</messages>"
        );
        assert_eq!(format_messages(&[]), "<messages>\n</messages>");
    }

    #[test]
    fn strip_internal_blocks() {
        assert_eq!(strip_internal_tags("Hello <internal>thinking</internal> World"), "Hello  World");
        assert_eq!(
            strip_internal_tags("Before\n<internal>\nmulti\nline\n</internal>\nAfter"),
            "Before\n\nAfter"
        );
        assert_eq!(strip_internal_tags("Hello <internal>never closed"), "Hello <internal>never closed");
        assert_eq!(format_outbound("<internal>only</internal>", None), None);
        assert_eq!(format_outbound(" hi ", Some("Hearth")).as_deref(), Some("Hearth: hi"));
    }

    struct Recording {
        prefix: &'static str,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Channel for Recording {
        fn name(&self) -> &str {
            "recording"
        }
        fn connect(&self, _on_message: InboundHandler) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn send_message<'a>(&'a self, address: &'a str, text: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                self.sent.lock().unwrap().push((address.to_string(), text.to_string()));
                Ok(())
            })
        }
        fn set_typing<'a>(&'a self, _address: &'a str, _typing: bool) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn owns_address(&self, address: &str) -> bool {
            address.starts_with(self.prefix)
        }
    }

    #[tokio::test]
    async fn routes_to_owning_channel() {
        let http = Arc::new(Recording { prefix: "http:", sent: Mutex::new(Vec::new()) });
        let http_dyn: Arc<dyn Channel> = http.clone();
        let router = ChannelRouter::new(vec![http_dyn.clone()]);
        router.send("http:team", "hello").await.unwrap();
        assert!(router.send("tg:1", "hello").await.is_err());
        assert_eq!(http.sent.lock().unwrap().as_slice(), &[("http:team".to_string(), "hello".to_string())]);

        let with_fallback = ChannelRouter::new(vec![http_dyn, Arc::new(LogChannel)]);
        with_fallback.send("tg:1", "hello").await.unwrap();
        assert_eq!(with_fallback.find("tg:1").map(|c| c.name()), Some("log"));
    }
}

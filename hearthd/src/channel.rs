//! Messaging channel collaborators.
//!
//! A channel owns a set of addresses, delivers outbound text and typing
//! state, and hands inbound messages to the daemon. `HttpBridgeChannel`
//! talks to an external bridge over HTTP; `LogChannel` only logs.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use hearth_core::config::HttpBridgeConfig;
use hearth_core::model::{NewMessage, format_ts};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

/// Receives inbound messages from a channel.
pub type InboundHandler = Arc<dyn Fn(NewMessage) -> anyhow::Result<()> + Send + Sync>;

pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Starts delivering inbound messages to `on_message`.
    fn connect(&self, on_message: InboundHandler) -> BoxFuture<'_, anyhow::Result<()>>;

    fn send_message<'a>(&'a self, address: &'a str, text: &'a str) -> BoxFuture<'a, anyhow::Result<()>>;

    fn set_typing<'a>(&'a self, address: &'a str, typing: bool) -> BoxFuture<'a, anyhow::Result<()>>;

    fn owns_address(&self, address: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Inbound clock
// ---------------------------------------------------------------------------

/// Issues strictly increasing inbound timestamps. The message loop only
/// fetches rows newer than its seen cursor, so a new row must sort after
/// everything already stored. A supplied timestamp is kept when it falls
/// between the last one issued and now; otherwise the row is stamped on receipt.
#[derive(Debug, Default)]
pub struct InboundClock {
    last_ms: AtomicI64,
}

impl InboundClock {
    /// Never issues a timestamp at or before `floor`.
    pub fn raise_floor(&self, floor: &str) {
        if let Ok(ts) = DateTime::parse_from_rfc3339(floor) {
            self.last_ms.fetch_max(ts.timestamp_millis(), Ordering::SeqCst);
        }
    }

    pub fn stamp(&self, requested: Option<DateTime<Utc>>) -> String {
        let now = Utc::now().timestamp_millis();
        let wanted = requested.map(|ts| ts.timestamp_millis()).filter(|ms| *ms <= now).unwrap_or(now);
        let mut issued = wanted;
        let _ = self.last_ms.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            issued = wanted.max(last + 1);
            Some(issued)
        });
        match Utc.timestamp_millis_opt(issued).single() {
            Some(ts) => format_ts(ts),
            None => format_ts(Utc::now()),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP bridge
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum OutboundEvent<'a> {
    Message { address: &'a str, text: &'a str },
    Typing { address: &'a str, typing: bool },
}

/// Outbound via POST to the bridge; inbound via the daemon's `/v1/inbound`.
pub struct HttpBridgeChannel {
    client: Client,
    outbound_url: String,
    address_prefix: String,
    inbound: OnceLock<InboundHandler>,
    clock: InboundClock,
}

impl HttpBridgeChannel {
    pub fn new(config: &HttpBridgeConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("failed to build bridge http client")?;
        Ok(Self {
            client,
            outbound_url: config.outbound_url.clone(),
            address_prefix: config.address_prefix.clone(),
            inbound: OnceLock::new(),
            clock: InboundClock::default(),
        })
    }

    /// Inbound rows will sort after `ts`, normally the newest stored message.
    pub fn resume_after(&self, ts: &str) {
        self.clock.raise_floor(ts);
    }

    /// Accepts one inbound message posted by the bridge.
    pub fn deliver(&self, mut message: NewMessage) -> anyhow::Result<()> {
        if !self.owns_address(&message.chat_jid) {
            bail!("address {} is not owned by this bridge", message.chat_jid);
        }
        if message.id.trim().is_empty() {
            bail!("inbound message id is empty");
        }
        let requested = if message.timestamp.trim().is_empty() {
            None
        } else {
            let parsed = DateTime::parse_from_rfc3339(message.timestamp.trim())
                .map_err(|_| anyhow!("invalid timestamp `{}`", message.timestamp))?;
            Some(parsed.with_timezone(&Utc))
        };
        message.timestamp = self.clock.stamp(requested);
        let handler = self
            .inbound
            .get()
            .ok_or_else(|| anyhow!("bridge channel is not connected"))?;
        handler(message)
    }

    async fn post(&self, event: &OutboundEvent<'_>) -> anyhow::Result<()> {
        self.client
            .post(&self.outbound_url)
            .json(event)
            .send()
            .await
            .context("failed to call bridge outbound endpoint")?
            .error_for_status()
            .context("bridge rejected outbound event")?;
        Ok(())
    }
}

impl Channel for HttpBridgeChannel {
    fn name(&self) -> &str {
        "http-bridge"
    }

    fn connect(&self, on_message: InboundHandler) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.inbound
                .set(on_message)
                .map_err(|_| anyhow!("bridge channel already connected"))?;
            info!(url = %self.outbound_url, prefix = %self.address_prefix, "http bridge connected");
            Ok(())
        })
    }

    fn send_message<'a>(&'a self, address: &'a str, text: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.post(&OutboundEvent::Message { address, text }).await?;
            debug!(address, len = text.len(), "message sent via bridge");
            Ok(())
        })
    }

    fn set_typing<'a>(&'a self, address: &'a str, typing: bool) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move { self.post(&OutboundEvent::Typing { address, typing }).await })
    }

    fn owns_address(&self, address: &str) -> bool {
        address.starts_with(&self.address_prefix)
    }
}

// ---------------------------------------------------------------------------
// Log-only fallback
// ---------------------------------------------------------------------------

/// Claims every address and logs instead of delivering.
#[derive(Debug, Default)]
pub struct LogChannel;

impl Channel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn connect(&self, _on_message: InboundHandler) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async {
            info!("log channel active, outbound messages are logged only");
            Ok(())
        })
    }

    fn send_message<'a>(&'a self, address: &'a str, text: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            info!(address, len = text.len(), "outbound message (log channel)");
            Ok(())
        })
    }

    fn set_typing<'a>(&'a self, address: &'a str, typing: bool) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            debug!(address, typing, "typing update (log channel)");
            Ok(())
        })
    }

    fn owns_address(&self, _address: &str) -> bool {
        true
    }
}

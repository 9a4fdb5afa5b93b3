//! Abstract `Notifier` (spec §9: "treat as an abstract `Notifier`
//! interface"). A no-op default keeps the keeper correct with no sink
//! configured; a Telegram implementation is provided since it's the sink
//! named in the original source, but any implementer could swap in a
//! different one without affecting keeper correctness.

use async_trait::async_trait;
use ethers::types::Address;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);

    async fn order_evicted(&self, account: Address, attempts: u32) {
        self.notify(&format!(
            "delayed order for {account:?} evicted after {attempts} failed execution attempts"
        ))
        .await;
    }
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, message: &str) {
        tracing::info!(%message, "notification (no sink configured)");
    }
}

pub struct TelegramNotifier {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            bot_token,
            chat_id,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let result = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": message,
            }))
            .send()
            .await;

        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to deliver telegram notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_notifier_does_not_panic() {
        let n = NoopNotifier;
        n.notify("test").await;
        n.order_evicted(Address::zero(), 10).await;
    }
}

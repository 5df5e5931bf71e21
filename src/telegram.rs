use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Minimal Telegram Bot API client: long-poll ingestion plus the few
/// outbound methods the gateway needs. The HTTP timeout rides slightly
/// above the long-poll window so Telegram, not the client, ends the poll.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    token: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub text: Option<String>,
    pub from: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub username: Option<String>,
    pub first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl TelegramClient {
    pub fn new(token: String, poll_timeout_sec: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(poll_timeout_sec + 15))
            .build()
            .unwrap_or_default();
        Self { token, client }
    }

    fn url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.token, method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<T> {
        let resp = self.client.post(self.url(method)).json(body).send().await?;
        let envelope: ApiEnvelope<T> = resp.json().await?;
        if !envelope.ok {
            anyhow::bail!(
                "telegram {} failed: {}",
                method,
                envelope.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        envelope
            .result
            .ok_or_else(|| anyhow::anyhow!("telegram {} returned no result", method))
    }

    pub async fn get_me(&self) -> anyhow::Result<BotIdentity> {
        self.call("getMe", &serde_json::json!({})).await
    }

    /// One long-poll iteration. Returns possibly-empty updates; the
    /// caller advances the offset past the highest update id.
    pub async fn get_updates(&self, offset: i64, timeout_sec: u64) -> anyhow::Result<Vec<Update>> {
        let body = serde_json::json!({
            "offset": offset,
            "timeout": timeout_sec,
            "allowed_updates": ["message"],
        });
        let updates: Vec<Update> = self.call("getUpdates", &body).await?;
        if !updates.is_empty() {
            debug!("telegram: {} update(s)", updates.len());
        }
        Ok(updates)
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({"chat_id": chat_id, "text": text});
        let _: Message = self.call("sendMessage", &body).await?;
        Ok(())
    }

    /// Send a PNG as a photo. Used by `/screen`.
    pub async fn send_photo(
        &self,
        chat_id: i64,
        png: Vec<u8>,
        caption: &str,
    ) -> anyhow::Result<()> {
        let part = reqwest::multipart::Part::bytes(png)
            .file_name("screen.png")
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("photo", part);
        let resp = self
            .client
            .post(self.url("sendPhoto"))
            .multipart(form)
            .send()
            .await?;
        let envelope: ApiEnvelope<Message> = resp.json().await?;
        if !envelope.ok {
            anyhow::bail!(
                "telegram sendPhoto failed: {}",
                envelope.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        Ok(())
    }

    /// Register the command menu shown by Telegram clients.
    pub async fn set_my_commands(&self, commands: &[(&str, &str)]) -> anyhow::Result<()> {
        let list: Vec<serde_json::Value> = commands
            .iter()
            .map(|(cmd, desc)| serde_json::json!({"command": cmd, "description": desc}))
            .collect();
        let _: bool = self
            .call("setMyCommands", &serde_json::json!({"commands": list}))
            .await?;
        Ok(())
    }

    /// Long-poll conflicts with a leftover webhook; clear it on startup.
    pub async fn delete_webhook(&self) -> anyhow::Result<()> {
        let _: bool = self.call("deleteWebhook", &serde_json::json!({})).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_parsing() {
        let raw = r#"{
            "ok": true,
            "result": [
                {"update_id": 10, "message": {"chat": {"id": 42}, "text": "hello", "from": {"username": "sam", "first_name": "Sam"}}},
                {"update_id": 11, "message": {"chat": {"id": 42}, "text": null, "from": null}}
            ]
        }"#;
        let envelope: ApiEnvelope<Vec<Update>> = serde_json::from_str(raw).unwrap();
        assert!(envelope.ok);
        let updates = envelope.result.unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].update_id, 10);
        assert_eq!(updates[0].message.as_ref().unwrap().chat.id, 42);
        assert_eq!(
            updates[0].message.as_ref().unwrap().text.as_deref(),
            Some("hello")
        );
        assert!(updates[1].message.as_ref().unwrap().text.is_none());
    }

    #[test]
    fn test_error_envelope() {
        let raw = r#"{"ok": false, "description": "Unauthorized"}"#;
        let envelope: ApiEnvelope<Vec<Update>> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.ok);
        assert_eq!(envelope.description.as_deref(), Some("Unauthorized"));
    }
}

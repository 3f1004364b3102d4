// ===============================
// src/user_feed.rs
// ===============================
//
// Authenticated user channel: own orders and trades for the followed markets.
// Topics are condition ids. The subscribe frame carries the API credentials;
// a rejected handshake or an auth error frame stops this connector for good.
//
use serde_json::{json, Value};

use crate::domain::SourceKind;
use crate::error::FeedError;
use crate::feed::Channel;
use crate::resolver::MarketIndex;

#[derive(Clone)]
pub struct UserCredentials {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

impl std::fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredentials").field("api_key", &self.api_key).finish_non_exhaustive()
    }
}

pub struct UserChannel {
    creds: UserCredentials,
}

impl UserChannel {
    pub fn new(creds: UserCredentials) -> Self { Self { creds } }
}

/// True for server frames that reject the supplied credentials.
fn is_auth_rejection(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    let looks_like_error = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(o)) => o.contains_key("error") || o.get("type").and_then(Value::as_str) == Some("error"),
        Ok(_) => false,
        Err(_) => true,
    };
    looks_like_error
        && (lower.contains("unauthorized")
            || lower.contains("invalid api key")
            || lower.contains("invalid auth")
            || lower.contains("authentication"))
}

impl Channel for UserChannel {
    fn source(&self) -> SourceKind { SourceKind::UserFeed }

    fn topics(&self, index: &MarketIndex) -> Vec<String> { index.condition_ids() }

    fn subscribe_frame(&self, topics: &[String]) -> Value {
        json!({
            "type": "user",
            "auth": {
                "apiKey": self.creds.api_key,
                "secret": self.creds.secret,
                "passphrase": self.creds.passphrase,
            },
            "markets": topics,
        })
    }

    fn add_topics_frame(&self, topics: &[String]) -> Value {
        json!({"markets": topics, "operation": "subscribe"})
    }

    fn check_text(&self, text: &str) -> Result<(), FeedError> {
        if is_auth_rejection(text) {
            return Err(FeedError::Authentication(text.chars().take(200).collect()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> UserChannel {
        UserChannel::new(UserCredentials { api_key: "k".into(), secret: "s".into(), passphrase: "p".into() })
    }

    #[test]
    fn subscribe_frame_carries_auth_and_markets() {
        let f = channel().subscribe_frame(&["0xc1".to_string()]);
        assert_eq!(f["type"], "user");
        assert_eq!(f["auth"]["apiKey"], "k");
        assert_eq!(f["auth"]["passphrase"], "p");
        assert_eq!(f["markets"], json!(["0xc1"]));
    }

    #[test]
    fn auth_rejection_is_fatal_other_frames_pass() {
        let c = channel();
        assert!(matches!(
            c.check_text(r#"{"error":"Unauthorized: invalid api key"}"#),
            Err(FeedError::Authentication(_))
        ));
        assert!(c.check_text("INVALID AUTHENTICATION").is_err());
        assert!(c.check_text(r#"{"event_type":"trade","id":"t1"}"#).is_ok());
        assert!(c.check_text("PONG").is_ok());
    }

    #[test]
    fn debug_hides_secrets() {
        let s = format!("{:?}", channel().creds);
        assert!(s.contains("\"k\"") && !s.contains("\"s\"") && !s.contains("\"p\""));
    }
}

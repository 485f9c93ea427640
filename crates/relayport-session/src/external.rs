//! Seams to the outside world: target resolution and session brokering

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Identifier of the remote target, as understood by the session broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteTargetId(pub String);

impl std::fmt::Display for RemoteTargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No target named '{0}'")]
    NotFound(String),

    #[error("Target name '{name}' is ambiguous: {}", .candidates.join(", "))]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },

    #[error("Target lookup failed: {0}")]
    Lookup(String),
}

/// Turns a human-friendly target name into a target id
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<RemoteTargetId, ResolveError>;
}

/// Credentials for one forwarding session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub session_id: String,
    pub token: String,
    pub stream_url: String,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected broker response: {0}")]
    InvalidResponse(String),
}

/// Creates a forwarding session for a target and remote port
#[async_trait]
pub trait SessionBroker: Send + Sync {
    async fn create_session(
        &self,
        target: &RemoteTargetId,
        remote_port: u16,
    ) -> Result<SessionGrant, BrokerError>;
}

/// A name usable with [`StaticResolver`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub name: String,
    pub id: String,
}

/// Whether `name` already is a target id rather than a friendly name
pub fn looks_like_target_id(name: &str) -> bool {
    let id = name
        .strip_prefix("i-")
        .or_else(|| name.strip_prefix("mi-"));
    matches!(id, Some(rest) if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Resolves names from a fixed list; ids pass through unchanged
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: Vec<TargetEntry>,
}

impl StaticResolver {
    pub fn new(entries: Vec<TargetEntry>) -> Self {
        Self { entries }
    }

    pub fn with_target(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
        self.entries.push(TargetEntry {
            name: name.into(),
            id: id.into(),
        });
        self
    }
}

#[async_trait]
impl TargetResolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<RemoteTargetId, ResolveError> {
        if looks_like_target_id(name) {
            debug!("'{}' is already a target id", name);
            return Ok(RemoteTargetId(name.to_string()));
        }

        let mut candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.name == name)
            .map(|entry| entry.id.clone())
            .collect();
        candidates.dedup();

        match candidates.len() {
            0 => Err(ResolveError::NotFound(name.to_string())),
            1 => Ok(RemoteTargetId(candidates.remove(0))),
            _ => Err(ResolveError::Ambiguous {
                name: name.to_string(),
                candidates,
            }),
        }
    }
}

/// Hands out a fixed stream endpoint, for direct agent connections
#[derive(Debug, Clone)]
pub struct StaticBroker {
    stream_url: String,
    token: String,
}

impl StaticBroker {
    pub fn new(stream_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            stream_url: stream_url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl SessionBroker for StaticBroker {
    async fn create_session(
        &self,
        target: &RemoteTargetId,
        remote_port: u16,
    ) -> Result<SessionGrant, BrokerError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!(
            "Static session {} for {}:{} via {}",
            session_id, target, remote_port, self.stream_url
        );
        Ok(SessionGrant {
            session_id,
            token: self.token.clone(),
            stream_url: self.stream_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_id_detection() {
        assert!(looks_like_target_id("i-0abc123def"));
        assert!(looks_like_target_id("mi-0123456789abcdef0"));
        assert!(!looks_like_target_id("jenkins"));
        assert!(!looks_like_target_id("i-"));
        assert!(!looks_like_target_id("i-web-server"));
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver::default()
            .with_target("jenkins", "i-0aaa")
            .with_target("db", "i-0bbb")
            .with_target("db", "i-0ccc");

        assert_eq!(
            resolver.resolve("jenkins").await.unwrap(),
            RemoteTargetId("i-0aaa".into())
        );
        assert_eq!(
            resolver.resolve("i-0fff").await.unwrap(),
            RemoteTargetId("i-0fff".into())
        );
        assert!(matches!(
            resolver.resolve("missing").await,
            Err(ResolveError::NotFound(_))
        ));
        match resolver.resolve("db").await {
            Err(ResolveError::Ambiguous { candidates, .. }) => {
                assert_eq!(candidates, vec!["i-0bbb", "i-0ccc"]);
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_static_broker_grants_unique_sessions() {
        let broker = StaticBroker::new("tcp://127.0.0.1:9000", "secret");
        let target = RemoteTargetId("i-0aaa".into());
        let first = broker.create_session(&target, 8080).await.unwrap();
        let second = broker.create_session(&target, 8080).await.unwrap();
        assert_eq!(first.stream_url, "tcp://127.0.0.1:9000");
        assert_eq!(first.token, "secret");
        assert_ne!(first.session_id, second.session_id);
    }
}

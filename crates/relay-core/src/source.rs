use async_trait::async_trait;

use crate::errors::RelayError;
use crate::payload::Payload;

/// Source of truth the hub polls before every broadcast round.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Payload, RelayError>;
}

/// Returns the same payload on every fetch.
#[derive(Clone, Debug)]
pub struct StaticSource {
    payload: Payload,
}

impl StaticSource {
    pub fn new(payload: Payload) -> Self {
        Self { payload }
    }
}

impl Default for StaticSource {
    fn default() -> Self {
        Self::new(
            Payload::new()
                .with("roomID", "asadadawra")
                .with("rateCode", "213141"),
        )
    }
}

#[async_trait]
impl DataSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<Payload, RelayError> {
        Ok(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_source_default_payload() {
        let source = StaticSource::default();
        let payload = source.fetch().await.unwrap();
        assert_eq!(payload.get("roomID").and_then(|v| v.as_str()), Some("asadadawra"));
        assert_eq!(payload.get("rateCode").and_then(|v| v.as_str()), Some("213141"));
    }

    #[tokio::test]
    async fn static_source_repeats() {
        let source = StaticSource::new(Payload::new().with("x", 1));
        let a = source.fetch().await.unwrap();
        let b = source.fetch().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(source.name(), "static");
    }
}

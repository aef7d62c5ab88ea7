use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::Serialize,
    serde_json::Value,
};

/// Opaque inbound event with a platform-assigned unique id.
///
/// Immutable once built; the payload is passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    id: i64,
    payload: Value,
    received_at: DateTime<Utc>,
}

impl Envelope {
    #[must_use]
    pub fn new(id: i64, payload: Value) -> Self {
        Self {
            id,
            payload,
            received_at: Utc::now(),
        }
    }

    /// Build an envelope from a raw platform update, which must carry an
    /// integer `update_id`.
    pub fn from_update(payload: Value) -> Option<Self> {
        let id = payload.get("update_id")?.as_i64()?;
        Some(Self::new(id, payload))
    }

    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    #[must_use]
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// Application-side consumer of envelopes. This crate knows nothing about
/// what an envelope means.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn from_update_reads_update_id() {
        let env = Envelope::from_update(json!({
            "update_id": 9_000_000_001_i64,
            "message": { "text": "hi" }
        }))
        .unwrap();
        assert_eq!(env.id(), 9_000_000_001);
        assert_eq!(env.payload()["message"]["text"], "hi");
    }

    #[test]
    fn from_update_requires_integer_id() {
        assert!(Envelope::from_update(json!({ "message": {} })).is_none());
        assert!(Envelope::from_update(json!({ "update_id": "12" })).is_none());
        assert!(Envelope::from_update(json!([1, 2])).is_none());
    }
}

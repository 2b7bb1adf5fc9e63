//! Upload events and the rules that route them to pipelines

use serde::{Deserialize, Serialize};

pub const EVENT_SOURCE: &str = "aws.s3";
pub const OBJECT_CREATED: &str = "Object Created";

/// An "object created" notification from the artifact store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectCreatedEvent {
    pub source: String,
    #[serde(alias = "detail-type")]
    pub detail_type: String,
    pub detail: EventDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDetail {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub key: String,
}

impl ObjectCreatedEvent {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            source: EVENT_SOURCE.to_string(),
            detail_type: OBJECT_CREATED.to_string(),
            detail: EventDetail {
                bucket: BucketRef { name: bucket.into() },
                object: ObjectRef { key: key.into() },
            },
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn bucket(&self) -> &str {
        &self.detail.bucket.name
    }

    pub fn key(&self) -> &str {
        &self.detail.object.key
    }
}

/// Starts one service's pipeline when its source bundle is uploaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerRule {
    pub service: String,
    pub bucket: String,
    pub key_prefix: String,
}

impl TriggerRule {
    pub fn new(service: impl Into<String>, bucket: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            bucket: bucket.into(),
            key_prefix: key_prefix.into(),
        }
    }

    pub fn matches(&self, event: &ObjectCreatedEvent) -> bool {
        event.source == EVENT_SOURCE
            && event.detail_type == OBJECT_CREATED
            && event.bucket() == self.bucket
            && event.key().starts_with(self.key_prefix.as_str())
    }

    /// Whether some key could match both rules
    pub fn overlaps(&self, other: &TriggerRule) -> bool {
        self.bucket == other.bucket
            && (self.key_prefix.starts_with(other.key_prefix.as_str())
                || other.key_prefix.starts_with(self.key_prefix.as_str()))
    }
}

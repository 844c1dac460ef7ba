use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::{BaseId, EventId};

/// A user-registered root whose contents are ingested.
///
/// The `resource_module` field is the stable string id of the resource
/// module driving the base; the module receives the whole record back on
/// every call so it can interpret `resource_params` however it likes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: BaseId,
    pub resource_module: String,
    pub resource_params: serde_json::Value,
}

/// A discrete named object inside a base.
///
/// Identity is `(base, external_id)`; all ingestion work is keyed by
/// `hash`, never by identity, so two resources with equal content share
/// every derived artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub base: BaseId,
    pub external_id: String,
    pub hash: ContentHash,
    pub content_type: String,
    pub meta: serde_json::Value,
    pub updated_at: i64,
}

/// What a scan observed about a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Updating {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Updating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Updating::Create => f.write_str("create"),
            Updating::Update => f.write_str("update"),
            Updating::Delete => f.write_str("delete"),
        }
    }
}

/// One element of the lazy event sequence yielded by a resource module's
/// scan. Finite and single-pass; the module durably forgets the event only
/// once `complete_event` is called.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    pub id: EventId,
    pub resource: Resource,
    pub path: PathBuf,
    pub updating: Updating,
}

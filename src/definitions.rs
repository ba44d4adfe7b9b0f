//! Definition payloads and their stored records.
//!
//! A definition is an immutable, id-addressed configuration object: a
//! workflow, a signal (event), a trigger or a coordination-board template.
//! Stores wrap each payload in a [`DefinitionRecord`] carrying its ETag.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::ETag;

/// A resolvable configuration object.
pub trait Definition: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Discriminator used by durable stores to keep kinds apart.
    const KIND: &'static str;

    /// Stable identifier for the lifetime of the definition.
    fn id(&self) -> Uuid;
}

/// Lightweight `{id, etag}` projection used for staleness checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionHeader {
    pub id: Uuid,
    pub etag: ETag,
}

/// A definition payload together with its version token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionRecord<T> {
    pub id: Uuid,
    pub etag: ETag,
    pub payload: T,
}

impl<T: Definition> DefinitionRecord<T> {
    /// Wrap `payload`, deriving the ETag from its content.
    pub fn new(payload: T) -> anyhow::Result<Self> {
        let etag = content_etag(&payload)?;
        Ok(Self {
            id: payload.id(),
            etag,
            payload,
        })
    }

    pub fn header(&self) -> DefinitionHeader {
        DefinitionHeader {
            id: self.id,
            etag: self.etag.clone(),
        }
    }
}

/// SHA-256 of the JSON form of `payload`, base64url without padding.
///
/// Identical payloads always hash to the same tag and any change to the
/// payload changes it.
pub fn content_etag<T: Serialize>(payload: &T) -> anyhow::Result<ETag> {
    let bytes = serde_json::to_vec(payload)?;
    let digest = Sha256::digest(&bytes);
    Ok(ETag::new(URL_SAFE_NO_PAD.encode(digest)))
}

/// A workflow: an ordered list of named stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub uid: Uuid,
    pub display_name: String,
    pub stages: Vec<String>,
}

impl Definition for WorkflowDefinition {
    const KIND: &'static str = "workflow";

    fn id(&self) -> Uuid {
        self.uid
    }
}

/// A named signal that triggers and workflows can react to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDefinition {
    pub uid: Uuid,
    pub name: String,
}

impl Definition for SignalDefinition {
    const KIND: &'static str = "signal";

    fn id(&self) -> Uuid {
        self.uid
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Cron { expression: String },
    Signal { signal: Uuid },
    Stream { queue: String },
}

/// Binds a trigger source to the workflows it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub uid: Uuid,
    pub display_name: String,
    pub source: TriggerSource,
    pub targets: Vec<Uuid>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Definition for TriggerDefinition {
    const KIND: &'static str = "trigger";

    fn id(&self) -> Uuid {
        self.uid
    }
}

/// Template a coordination board is instantiated from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardTemplateDefinition {
    pub uid: Uuid,
    pub unique_template_name: String,
    pub controllers: Vec<String>,
}

impl Definition for BoardTemplateDefinition {
    const KIND: &'static str = "board_template";

    fn id(&self) -> Uuid {
        self.uid
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definitions::{Definition, DefinitionHeader, DefinitionRecord};
use crate::types::ETag;

/// Row shape of the `definition` table as selected by the stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDefinition {
    pub uid: String,
    pub etag: String,
    pub payload: Value,
}

impl StoredDefinition {
    pub fn into_record<T: Definition>(self) -> Result<DefinitionRecord<T>> {
        let id = Uuid::parse_str(&self.uid)
            .with_context(|| format!("invalid definition uid `{}`", self.uid))?;
        let payload: T = serde_json::from_value(self.payload)
            .with_context(|| format!("malformed {} definition {}", T::KIND, id))?;

        Ok(DefinitionRecord {
            id,
            etag: ETag::new(self.etag),
            payload,
        })
    }
}

/// Header-only projection of the `definition` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredHeader {
    pub uid: String,
    pub etag: String,
}

impl StoredHeader {
    pub fn into_header(self) -> Result<DefinitionHeader> {
        let id = Uuid::parse_str(&self.uid)
            .with_context(|| format!("invalid definition uid `{}`", self.uid))?;
        Ok(DefinitionHeader {
            id,
            etag: ETag::new(self.etag),
        })
    }
}

/// Row shape of the `admin_state` table. The state itself is kept as an
/// opaque JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAdminState {
    pub instance: String,
    pub state: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::SignalDefinition;

    #[test]
    fn test_stored_definition_into_record() {
        let uid = Uuid::new_v4();
        let row = StoredDefinition {
            uid: uid.to_string(),
            etag: "e1".to_string(),
            payload: serde_json::json!({"uid": uid, "name": "order-created"}),
        };

        let record: DefinitionRecord<SignalDefinition> = row.into_record().unwrap();
        assert_eq!(record.id, uid);
        assert_eq!(record.etag, ETag::new("e1"));
        assert_eq!(record.payload.name, "order-created");
    }

    #[test]
    fn test_stored_definition_rejects_bad_uid() {
        let row = StoredDefinition {
            uid: "not-a-uuid".to_string(),
            etag: "e1".to_string(),
            payload: serde_json::json!({}),
        };

        assert!(row.into_record::<SignalDefinition>().is_err());
    }
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tracing::debug;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("SURREALDB_URL")
                .unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("SURREALDB_NAMESPACE")
                .unwrap_or_else(|_| "unicity".to_string()),
            database: env::var("SURREALDB_DATABASE")
                .unwrap_or_else(|_| "registry".to_string()),
            username: env::var("SURREALDB_USERNAME").ok(),
            password: env::var("SURREALDB_PASSWORD").ok(),
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    debug!("Connecting to SurrealDB at {}", config.url);
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = vec![
        // Definitions of every kind share one table, split by `kind`
        "DEFINE TABLE IF NOT EXISTS definition SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS uid ON TABLE definition TYPE string;
         DEFINE FIELD IF NOT EXISTS kind ON TABLE definition TYPE string;
         DEFINE FIELD IF NOT EXISTS etag ON TABLE definition TYPE string;
         DEFINE FIELD IF NOT EXISTS updated_at ON TABLE definition VALUE time::now();",

        // One persisted state record per administration registry instance
        "DEFINE TABLE IF NOT EXISTS admin_state SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS instance ON TABLE admin_state TYPE string;
         DEFINE FIELD IF NOT EXISTS updated_at ON TABLE admin_state VALUE time::now();",

        "DEFINE INDEX IF NOT EXISTS definition_kind_uid ON TABLE definition COLUMNS kind, uid UNIQUE;
         DEFINE INDEX IF NOT EXISTS admin_state_instance ON TABLE admin_state COLUMNS instance UNIQUE;",
    ];

    for query in schema_queries {
        db.query(query).await?.check()?;
    }

    Ok(())
}

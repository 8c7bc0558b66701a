//! Table registry: which tables of which source are relayed, and their keys.
//!
//! Tables come from the `tables` section of each source in the settings and
//! from `registry.toml` in the state dir, which the `register` command
//! maintains. Registry entries win over settings for the same table.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::{
    error::{RelayError, Result},
    model::TableSchema,
    settings::Settings,
};

pub const REGISTRY_FILE: &str = "registry.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    source: String,
    #[serde(flatten)]
    schema: TableSchema,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    tables: Vec<Entry>,
}

pub struct Registry {
    path: PathBuf,
    /// (source, table) to schema
    tables: BTreeMap<(String, String), TableSchema>,
}

impl Registry {
    /// Loads the registry file under `state_dir`, a missing file is an empty
    /// registry
    pub async fn load(state_dir: &str) -> Result<Registry> {
        let path = Path::new(state_dir).join(REGISTRY_FILE);
        let file: RegistryFile = match fs::read_to_string(&path).await {
            Ok(s) => toml::from_str(&s)
                .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Registry {
            path,
            tables: file
                .tables
                .into_iter()
                .map(|e| ((e.source, e.schema.table.clone()), e.schema))
                .collect(),
        })
    }

    /// Adds or replaces a table and persists the registry
    pub async fn register(&mut self, source: &str, schema: TableSchema) -> Result<()> {
        if schema.primary_key.is_empty() {
            return Err(RelayError::Config(format!(
                "table {} has no primary key",
                schema.table
            )));
        }
        info!(
            source,
            table = %schema.table,
            primary_key = ?schema.primary_key,
            "table_registered"
        );
        self.tables
            .insert((source.to_owned(), schema.table.clone()), schema);
        self.save().await
    }

    /// Tables relayed from `source`: settings first, then registry entries
    pub fn tables_for(&self, source: &str, settings: &Settings) -> Vec<TableSchema> {
        let mut tables: BTreeMap<String, TableSchema> = settings
            .sources
            .get(source)
            .map(|s| {
                s.tables
                    .iter()
                    .map(|(table, def)| (table.clone(), def.schema(table)))
                    .collect()
            })
            .unwrap_or_default();
        for ((s, table), schema) in &self.tables {
            if s == source {
                tables.insert(table.clone(), schema.clone());
            }
        }
        tables.into_values().collect()
    }

    /// Every table of every source, deduplicated by table name
    pub fn all_tables(&self, settings: &Settings) -> Vec<TableSchema> {
        let mut tables = BTreeMap::new();
        for source in settings.sources.keys() {
            for schema in self.tables_for(source, settings) {
                tables.insert(schema.table.clone(), schema);
            }
        }
        tables.into_values().collect()
    }

    async fn save(&self) -> Result<()> {
        let file = RegistryFile {
            tables: self
                .tables
                .iter()
                .map(|((source, _), schema)| Entry {
                    source: source.clone(),
                    schema: schema.clone(),
                })
                .collect(),
        };
        let body = toml::to_string(&file)
            .map_err(|e| RelayError::Config(format!("registry: {e}")))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(table: &str, pk: &[&str]) -> TableSchema {
        TableSchema {
            table: table.into(),
            version: 1,
            primary_key: pk.iter().map(|c| c.to_string()).collect(),
            columns: vec![],
        }
    }

    #[tokio::test]
    async fn test_register_persists() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().to_str().unwrap();
        let settings = Settings::default();

        let mut registry = Registry::load(state_dir).await.unwrap();
        assert!(registry.tables_for("pg", &settings).is_empty());
        registry.register("pg", schema("users", &["id"])).await.unwrap();
        registry
            .register("pg", schema("orders", &["tenant", "id"]))
            .await
            .unwrap();
        registry.register("mysql", schema("items", &["sku"])).await.unwrap();
        assert!(registry.register("pg", schema("logs", &[])).await.is_err());

        let registry = Registry::load(state_dir).await.unwrap();
        let tables = registry.tables_for("pg", &settings);
        assert_eq!(tables, vec![schema("orders", &["tenant", "id"]), schema("users", &["id"])]);
    }
}

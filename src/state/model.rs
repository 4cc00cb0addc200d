// src/state/model.rs

//! Decrypted project state
//!
//! The state file holds everything project-local and user-owned: named
//! connection configs, their secrets, app-level secrets, the crypto
//! identity, and the roster of collaborators seen in the tracking tables.
//! It is serialized as camelCase JSON, encrypted, and never committed.

use crate::db::adapter::Dialect;
use crate::identity::CryptoIdentity;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Relative schema/changes locations for one config
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPaths {
    #[serde(default = "default_sql_dir")]
    pub sql_dir: String,
    #[serde(default = "default_changes_dir")]
    pub changes_dir: String,
}

fn default_sql_dir() -> String {
    "sql".to_string()
}

fn default_changes_dir() -> String {
    "changes".to_string()
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            sql_dir: default_sql_dir(),
            changes_dir: default_changes_dir(),
        }
    }
}

/// A named connection + paths bundle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub dialect: Dialect,
    /// Database name, or the file path for SQLite
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub paths: ConfigPaths,
    /// Stage this config is linked to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub is_test: bool,
    /// Per-config identity override (name, email)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<ConfigIdentity>,
    /// Free-form fields, kept verbatim and exposed to templates
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigIdentity {
    pub name: String,
    pub email: String,
}

impl Config {
    pub fn new(dialect: Dialect, database: impl Into<String>) -> Self {
        Self {
            dialect,
            database: database.into(),
            host: None,
            port: None,
            username: None,
            password: None,
            paths: ConfigPaths::default(),
            stage: None,
            protected: false,
            is_test: false,
            identity: None,
            extra: BTreeMap::new(),
        }
    }

    /// Template-visible fields. Password material never reaches a render.
    pub fn public_fields(&self) -> Value {
        let mut fields = json!({
            "dialect": self.dialect.as_str(),
            "database": self.database,
            "host": self.host,
            "port": self.port,
            "username": self.username,
            "stage": self.stage,
            "protected": self.protected,
            "isTest": self.is_test,
        });
        if let Value::Object(map) = &mut fields {
            for (key, value) in &self.extra {
                map.insert(key.clone(), value.clone());
            }
        }
        fields
    }
}

/// A collaborator seen in the shared identities table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KnownUser {
    pub name: String,
    pub email: String,
    pub machine: String,
    pub first_seen: String,
    pub last_seen: String,
}

/// The decrypted state payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub schema_version: i64,
    #[serde(default)]
    pub active_config: Option<String>,
    #[serde(default)]
    pub configs: BTreeMap<String, Config>,
    /// Config-scoped secrets: config name -> key -> value
    #[serde(default)]
    pub secrets: BTreeMap<String, BTreeMap<String, String>>,
    /// App-level secrets independent of any config
    #[serde(default)]
    pub global_secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub identity: Option<CryptoIdentity>,
    /// Collaborator roster keyed by identity hash
    #[serde(default)]
    pub known_users: BTreeMap<String, KnownUser>,
}

impl State {
    /// A fresh state at the given schema version
    pub fn empty(schema_version: i64) -> Self {
        Self {
            schema_version,
            active_config: None,
            configs: BTreeMap::new(),
            secrets: BTreeMap::new(),
            global_secrets: BTreeMap::new(),
            identity: None,
            known_users: BTreeMap::new(),
        }
    }
}

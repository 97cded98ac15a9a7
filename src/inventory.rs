//! Read-only host inventory.
//!
//! A YAML file listing known hosts. `connect` requests may name a record by
//! `hostId` instead of spelling out address, port, and user.
//!
//! ```yaml
//! version: 1
//! hosts:
//!   - id: db01
//!     name: Database
//!     address: 10.0.0.12
//!     port: 22
//!     user: deploy
//!     auth: { type: key, key_id: id_ed25519 }
//!     groups: [prod]
//!     tags: [postgres]
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Failed to read hosts file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse hosts file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("Invalid host {id:?}: {reason}")]
    Invalid { id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Key,
    #[default]
    Agent,
    Password,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAuth {
    #[serde(rename = "type", default)]
    pub kind: AuthType,
    /// Key file name, resolved against the configured key directory when
    /// relative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
}

fn default_port() -> u16 {
    22
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub auth: HostAuth,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
}

impl Host {
    fn validate(&self) -> Result<(), InventoryError> {
        let invalid = |reason: &str| InventoryError::Invalid {
            id: self.id.clone(),
            reason: reason.to_string(),
        };
        if self.id.is_empty() {
            return Err(invalid("id cannot be empty"));
        }
        if self.address.is_empty() {
            return Err(invalid("address cannot be empty"));
        }
        if self.user.is_empty() {
            return Err(invalid("user cannot be empty"));
        }
        if self.port == 0 {
            return Err(invalid("port must be between 1 and 65535"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostsFile {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub hosts: Vec<Host>,
}

/// Hosts keyed by id.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: HashMap<String, Host>,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| InventoryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let inventory = Self::parse(&raw).map_err(|e| match e {
            InventoryError::Parse { source, .. } => InventoryError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        info!(
            "Loaded {} host(s) from {}",
            inventory.hosts.len(),
            path.display()
        );
        Ok(inventory)
    }

    pub fn parse(yaml: &str) -> Result<Self, InventoryError> {
        let file: HostsFile =
            serde_yaml::from_str(yaml).map_err(|source| InventoryError::Parse {
                path: String::new(),
                source,
            })?;
        let mut hosts = HashMap::with_capacity(file.hosts.len());
        for host in file.hosts {
            host.validate()?;
            if hosts.contains_key(&host.id) {
                return Err(InventoryError::Invalid {
                    id: host.id,
                    reason: "duplicate id".into(),
                });
            }
            hosts.insert(host.id.clone(), host);
        }
        Ok(Self { hosts })
    }

    pub fn get(&self, id: &str) -> Option<Host> {
        self.hosts.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 1
hosts:
  - id: db01
    name: Database
    address: 10.0.0.12
    port: 2222
    user: deploy
    auth:
      type: key
      key_id: id_ed25519
    groups: [prod]
    tags: [postgres]
    notes: primary
    created: "2024-05-01T10:00:00Z"
  - id: web01
    name: Web
    address: web.internal
    user: www
"#;

    #[test]
    fn test_parse_and_get() {
        let inv = Inventory::parse(SAMPLE).unwrap();
        assert_eq!(inv.len(), 2);
        let db = inv.get("db01").unwrap();
        assert_eq!(db.address, "10.0.0.12");
        assert_eq!(db.port, 2222);
        assert_eq!(db.auth.kind, AuthType::Key);
        assert_eq!(db.auth.key_id.as_deref(), Some("id_ed25519"));
        assert_eq!(db.groups, vec!["prod".to_string()]);
        assert!(inv.get("nope").is_none());
    }

    #[test]
    fn test_defaults() {
        let inv = Inventory::parse(SAMPLE).unwrap();
        let web = inv.get("web01").unwrap();
        assert_eq!(web.port, 22);
        assert_eq!(web.auth.kind, AuthType::Agent);
        assert!(web.tags.is_empty());
    }

    #[test]
    fn test_rejects_invalid_and_duplicate_hosts() {
        let missing_user = "hosts:\n  - {id: a, address: h, user: ''}\n";
        assert!(matches!(
            Inventory::parse(missing_user),
            Err(InventoryError::Invalid { .. })
        ));
        let dup = "hosts:\n  - {id: a, address: h, user: u}\n  - {id: a, address: h2, user: u}\n";
        let err = Inventory::parse(dup).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("hosts.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(Inventory::load(&path).unwrap().len(), 2);

        std::fs::write(&path, "hosts: [").unwrap();
        let err = Inventory::load(&path).unwrap_err();
        assert!(err.to_string().contains("hosts.yaml"));
    }
}

// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// SPDX-License-Identifier: MIT

//! Optional persistence boundary for offline sessions. The broker core
//! serializes a snapshot of the durable session fields on disconnect and
//! asks for it back on resumption; everything else stays in memory.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Durable subset of a subscription. A set share-name marks membership in
/// that share group; the filter is then the plain part without the
/// `$share/{name}/` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSubscription {
    pub filter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_name: Option<String>,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_id: Option<u32>,
}

/// Durable subset of a session, serialized to bytes by the broker core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub session_expiry_interval: u32,
    pub subscriptions: Vec<SnapshotSubscription>,
}

impl SessionSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Key-value storage the core may call on session snapshot/restore.
pub trait SessionStorage: Send {
    fn save(&mut self, client_id: &str, bytes: &[u8]) -> Result<()>;
    fn load(&mut self, client_id: &str) -> Result<Option<Vec<u8>>>;
    fn remove(&mut self, client_id: &str) -> Result<()>;
}

/// Default storage: keeps nothing.
pub struct NoopStorage;

impl SessionStorage for NoopStorage {
    fn save(&mut self, _client_id: &str, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }

    fn load(&mut self, _client_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn remove(&mut self, _client_id: &str) -> Result<()> {
        Ok(())
    }
}

/// One JSON file per ClientID under a directory.
pub struct DirStorage {
    dir: PathBuf,
}

impl DirStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, client_id: &str) -> PathBuf {
        // ClientIDs may contain path-hostile characters; hex keeps the
        // filename flat.
        self.dir.join(format!("{}.json", hex::encode(client_id)))
    }
}

impl SessionStorage for DirStorage {
    fn save(&mut self, client_id: &str, bytes: &[u8]) -> Result<()> {
        std::fs::write(self.path_for(client_id), bytes)?;
        Ok(())
    }

    fn load(&mut self, client_id: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(client_id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&mut self, client_id: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(client_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

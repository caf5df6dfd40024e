//! Announced-client metadata and the per-session client registry.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::RwLock;

use crate::{AppError, Result};

/// One announced client process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Application name advertised in the announce message.
    pub application_name: String,
    /// Capability tokens the client supports.
    pub capabilities: Vec<String>,
    /// Executable name the client reported.
    pub executable_name: String,
    /// Protocol major version.
    pub major: i32,
    /// Protocol minor version.
    pub minor: i32,
    /// Process identifier; the registry key.
    pub pid: i32,
    /// Network address the announce arrived from.
    pub addr: SocketAddr,
}

/// Concurrency-safe mapping from pid to announced client.
///
/// All access goes through methods that copy data out while holding the
/// lock; the backing map is never exposed.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<i32, Client>>,
}

impl ClientRegistry {
    /// Insert a newly announced client.
    ///
    /// Existence check and insert happen under one write-lock acquisition.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyExists` if the pid is already registered;
    /// the existing entry is left unchanged.
    pub fn insert(&self, client: Client) -> Result<()> {
        let mut clients = self.clients.write();
        if clients.contains_key(&client.pid) {
            return Err(AppError::AlreadyExists(format!(
                "client with pid {} already exists",
                client.pid
            )));
        }
        clients.insert(client.pid, client);
        Ok(())
    }

    /// Copy of the full pid→client mapping.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<i32, Client> {
        self.clients.read().clone()
    }

    /// Number of announced clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// Whether no client has announced yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

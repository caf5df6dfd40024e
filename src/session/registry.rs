//! Registry of all sessions under the home directory.
//!
//! Tracks which session is current and persists that choice in a marker
//! file at the home directory root so it survives restarts. One
//! reader/writer lock spans both the session map and the current-name
//! field, which makes check+create and remove+re-elect atomic.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::session::Session;
use crate::supervisor::Supervisor;
use crate::{AppError, Result};

/// Marker file naming the current session, stored inside the home dir.
pub const CURRENT_MARKER: &str = ".current";

#[derive(Debug)]
struct Inner {
    sessions: HashMap<String, Arc<Session>>,
    current: Option<String>,
}

/// Owns every session found on disk under the home directory.
#[derive(Debug)]
pub struct SessionRegistry {
    home: PathBuf,
    supervisor: Supervisor,
    grace: Duration,
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    /// Open the registry: create the home directory if needed, load every
    /// session subdirectory, and resolve the current session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on directory failure, or
    /// `AppError::InconsistentState` if the current-session marker names
    /// an untracked session (startup must refuse rather than guess).
    pub async fn open(home: PathBuf, supervisor: Supervisor, grace: Duration) -> Result<Self> {
        tokio::fs::create_dir_all(&home)
            .await
            .map_err(|err| AppError::Io(format!("creating home {}: {err}", home.display())))?;
        let registry = Self {
            home,
            supervisor,
            grace,
            inner: RwLock::new(Inner {
                sessions: HashMap::new(),
                current: None,
            }),
        };
        registry.read().await?;
        registry.select_current().await?;
        Ok(registry)
    }

    /// The registry's home directory.
    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Create a new session named `name` and make it current.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` for an unusable name,
    /// `AppError::AlreadyExists` if the session is already tracked, or
    /// `AppError::Io` on directory failure.
    pub async fn create(&self, name: &str) -> Result<()> {
        validate_session_name(name)?;
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(name) {
            return Err(AppError::AlreadyExists(format!(
                "session already present {name}"
            )));
        }
        let session = Session::open(
            self.home.join(name),
            self.supervisor.clone(),
            self.grace,
        )?;
        inner.sessions.insert(name.to_owned(), Arc::new(session));
        inner.current = Some(name.to_owned());
        self.persist_current(&inner).await?;
        info!(session = name, "session created and selected");
        Ok(())
    }

    /// Remove the session named `name`, deleting its directory tree.
    ///
    /// If the removed session was current, an arbitrary remaining session
    /// becomes current (or none when the registry is empty).
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if untracked, `AppError::UnsavedChanges`
    /// if the session is dirty, or `AppError::Io` on deletion failure.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {name} not found")))?;
        if session.dirty().await {
            return Err(AppError::UnsavedChanges(format!(
                "session {name} has clients with unsaved changes"
            )));
        }
        tokio::fs::remove_dir_all(session.path()).await.map_err(|err| {
            AppError::Io(format!("removing {}: {err}", session.path().display()))
        })?;
        inner.sessions.remove(name);
        if inner.current.as_deref() == Some(name) {
            inner.current = inner.sessions.keys().next().cloned();
            self.persist_current(&inner).await?;
        }
        info!(session = name, "session removed");
        Ok(())
    }

    /// Re-scan the home directory and resynchronize the session map.
    ///
    /// Every immediate subdirectory is a session. New directories are
    /// loaded, vanished ones dropped; names that persist keep their live
    /// `Session` object so running process groups are not orphaned. If the
    /// current session vanished, a survivor is elected and the marker
    /// rewritten.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the home directory cannot be scanned.
    pub async fn read(&self) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.home)
            .await
            .map_err(|err| AppError::Io(format!("reading {}: {err}", self.home.display())))?;
        let mut found = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|err| AppError::Io(format!("scanning {}: {err}", self.home.display())))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| AppError::Io(format!("stat in home: {err}")))?;
            if file_type.is_dir() {
                found.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        let mut inner = self.inner.write().await;
        let mut sessions = HashMap::with_capacity(found.len());
        for name in found {
            if let Some(existing) = inner.sessions.get(&name) {
                sessions.insert(name, Arc::clone(existing));
            } else {
                let session = Session::open(
                    self.home.join(&name),
                    self.supervisor.clone(),
                    self.grace,
                )?;
                sessions.insert(name, Arc::new(session));
            }
        }
        inner.sessions = sessions;
        if let Some(current) = &inner.current {
            if !inner.sessions.contains_key(current) {
                inner.current = inner.sessions.keys().next().cloned();
                self.persist_current(&inner).await?;
            }
        }
        debug!(count = inner.sessions.len(), "session scan complete");
        Ok(())
    }

    /// Resolve the current session from the marker file.
    ///
    /// An absent marker selects an arbitrary session (or none when the
    /// registry is empty) and persists that pick, so it is stable across
    /// restarts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InconsistentState` if the marker names an
    /// untracked session, or `AppError::Io` on read failure.
    pub async fn select_current(&self) -> Result<()> {
        let marker = self.home.join(CURRENT_MARKER);
        let mut inner = self.inner.write().await;
        match tokio::fs::read_to_string(&marker).await {
            Ok(contents) => {
                let name = contents.trim();
                if inner.sessions.contains_key(name) {
                    inner.current = Some(name.to_owned());
                    debug!(session = name, "current session restored from marker");
                    Ok(())
                } else {
                    Err(AppError::InconsistentState(format!(
                        "current-session marker names untracked session {name}"
                    )))
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                inner.current = inner.sessions.keys().next().cloned();
                if inner.current.is_some() {
                    self.persist_current(&inner).await?;
                }
                Ok(())
            }
            Err(err) => Err(AppError::Io(format!(
                "reading {}: {err}",
                marker.display()
            ))),
        }
    }

    /// The current session, if any session exists.
    pub async fn current(&self) -> Option<Arc<Session>> {
        let inner = self.inner.read().await;
        inner
            .current
            .as_ref()
            .and_then(|name| inner.sessions.get(name))
            .map(Arc::clone)
    }

    /// Sorted session names plus the index of the current one (-1 when
    /// there is no current session).
    pub async fn listing(&self) -> (Vec<String>, i32) {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner.sessions.keys().cloned().collect();
        names.sort();
        let index = inner.current.as_ref().map_or(-1, |current| {
            names
                .iter()
                .position(|name| name == current)
                .and_then(|pos| i32::try_from(pos).ok())
                .unwrap_or(-1)
        });
        (names, index)
    }

    /// Join every session's process group; the supervisor's shutdown join
    /// point.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` aggregating all sessions' failures.
    pub async fn shutdown(&self) -> Result<()> {
        let sessions: Vec<Arc<Session>> = {
            let inner = self.inner.read().await;
            inner.sessions.values().map(Arc::clone).collect()
        };
        let mut failures = Vec::new();
        for session in sessions {
            if let Err(err) = session.wait_processes().await {
                failures.push(format!("{}: {err}", session.name()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppError::Process(failures.join("; ")))
        }
    }

    async fn persist_current(&self, inner: &Inner) -> Result<()> {
        let marker = self.home.join(CURRENT_MARKER);
        match &inner.current {
            Some(name) => tokio::fs::write(&marker, format!("{name}\n"))
                .await
                .map_err(|err| AppError::Io(format!("writing {}: {err}", marker.display()))),
            None => match tokio::fs::remove_file(&marker).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(AppError::Io(format!(
                    "removing {}: {err}",
                    marker.display()
                ))),
            },
        }
    }
}

fn validate_session_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(AppError::InvalidArgument(
            "session name must not be empty".into(),
        ));
    }
    if name.starts_with('.') || name.contains('/') || name.contains('\\') {
        return Err(AppError::InvalidArgument(format!(
            "session name must be a plain directory name, got {name}"
        )));
    }
    Ok(())
}

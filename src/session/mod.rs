//! Sessions: named, disk-persisted groupings of client processes.
//!
//! A session's identity is its directory under the home dir. The
//! directory holds one subdirectory per spawned client, each containing
//! the durable `.stdout`/`.stderr` capture files.

pub mod client;
pub mod registry;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tracing::{debug, info};

use crate::process::{LogPaths, ProcessGroup};
use crate::protocol::{self, Args};
use crate::supervisor::Supervisor;
use crate::{AppError, Result};

use client::{Client, ClientRegistry};

/// Environment variable telling a spawned client where to announce back.
pub const ANNOUNCE_URL_ENV: &str = "STAGEHAND_URL";

/// One addressable unit of work: a directory, a client registry, and a
/// process group.
#[derive(Debug)]
pub struct Session {
    name: String,
    path: PathBuf,
    clients: ClientRegistry,
    procs: ProcessGroup,
}

impl Session {
    /// Open a session at `path`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn open(path: PathBuf, supervisor: Supervisor, grace: Duration) -> Result<Self> {
        std::fs::create_dir_all(&path)
            .map_err(|err| AppError::Io(format!("creating session {}: {err}", path.display())))?;
        let name = path.file_name().map_or_else(
            || path.to_string_lossy().into_owned(),
            |base| base.to_string_lossy().into_owned(),
        );
        Ok(Self {
            name,
            path,
            clients: ClientRegistry::default(),
            procs: ProcessGroup::new(supervisor, grace),
        })
    }

    /// The session's name (its directory base name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The session's directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The session's announced-client registry.
    #[must_use]
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Spawn a new client from an add request: exactly two arguments, a
    /// caller-chosen client name and an executable path.
    ///
    /// The child inherits the supervisor's environment plus
    /// [`ANNOUNCE_URL_ENV`] pointing at `announce_url`. Its log
    /// subdirectory is created before the spawn. Returns the client name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedRequest` on a bad argument shape,
    /// `AppError::InvalidArgument` for an unusable client name,
    /// `AppError::AlreadyExists` on a duplicate client name, or
    /// `AppError::Io` on directory or spawn failure.
    pub async fn spawn_from(&self, args: &Args<'_>, announce_url: &str) -> Result<String> {
        args.expect_len(2, "add")?;
        let client_name = args.string(0, "client name")?;
        validate_client_name(client_name)?;
        let program = args.string(1, "executable path")?;

        let log_dir = self.path.join(client_name);
        tokio::fs::create_dir_all(&log_dir).await.map_err(|err| {
            AppError::Io(format!(
                "creating client directory {}: {err}",
                log_dir.display()
            ))
        })?;

        let env = vec![(ANNOUNCE_URL_ENV.to_owned(), announce_url.to_owned())];
        self.procs.add(client_name, program, &env, &log_dir).await?;

        info!(
            session = %self.name,
            client = client_name,
            program,
            "client spawned, awaiting announce"
        );
        Ok(client_name.to_owned())
    }

    /// Accept a client announcement: exactly six typed fields.
    ///
    /// On success the client is inserted into the registry; on any parse
    /// failure the registry is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedRequest` on a bad argument shape, or
    /// `AppError::AlreadyExists` for a duplicate pid.
    pub fn announce(&self, args: &Args<'_>, peer: SocketAddr) -> Result<Client> {
        args.expect_len(6, "announce")?;
        let client = Client {
            application_name: args.string(0, "application name")?.to_owned(),
            capabilities: protocol::parse_capabilities(args.string(1, "capabilities")?),
            executable_name: args.string(2, "executable name")?.to_owned(),
            major: args.int(3, "api major version")?,
            minor: args.int(4, "api minor version")?,
            pid: args.int(5, "pid")?,
            addr: peer,
        };
        self.clients.insert(client.clone())?;
        debug!(
            session = %self.name,
            pid = client.pid,
            application = %client.application_name,
            "client announced"
        );
        Ok(client)
    }

    /// Durable log file paths for a spawned client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such client was spawned here.
    pub async fn log_paths(&self, client_name: &str) -> Result<LogPaths> {
        self.procs.output_paths(client_name).await
    }

    /// Ordered non-blank lines from a client's captured output stream.
    ///
    /// `selector` must be [`protocol::STDOUT_SELECTOR`] or
    /// [`protocol::STDERR_SELECTOR`]. Each line is trimmed of NUL padding
    /// and surrounding whitespace; blank lines are dropped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidArgument` for an unknown selector,
    /// `AppError::NotFound` for an unknown client, or `AppError::Io` if
    /// the log file cannot be opened or read.
    pub async fn logs(&self, client_name: &str, selector: i32) -> Result<Vec<String>> {
        if selector != protocol::STDOUT_SELECTOR && selector != protocol::STDERR_SELECTOR {
            return Err(AppError::InvalidArgument(format!(
                "stream selector must be {} or {}, got {selector}",
                protocol::STDOUT_SELECTOR,
                protocol::STDERR_SELECTOR
            )));
        }
        let paths = self.procs.output_paths(client_name).await?;
        let path = if selector == protocol::STDOUT_SELECTOR {
            paths.stdout
        } else {
            paths.stderr
        };

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| AppError::Io(format!("opening {}: {err}", path.display())))?;
        let mut lines = tokio::io::BufReader::new(file).lines();
        let mut out = Vec::new();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|err| AppError::Io(format!("reading {}: {err}", path.display())))?
        {
            let trimmed = line.trim_matches('\0').trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_owned());
            }
        }
        Ok(out)
    }

    /// Whether the session holds state that would be lost on removal.
    ///
    /// A session is dirty while any of its client processes is still
    /// running.
    pub async fn dirty(&self) -> bool {
        self.procs.has_running().await
    }

    /// Join every client process and output-copy task of this session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` aggregating all non-clean exits.
    pub async fn wait_processes(&self) -> Result<()> {
        self.procs.wait().await
    }
}

// The client name becomes a subdirectory of the session, so it must not
// be able to escape it.
fn validate_client_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(AppError::InvalidArgument(
            "client name must not be empty".into(),
        ));
    }
    if name.starts_with('.') || name.contains('/') || name.contains('\\') {
        return Err(AppError::InvalidArgument(format!(
            "client name must be a plain directory name, got {name}"
        )));
    }
    Ok(())
}

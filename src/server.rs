//! UDP protocol dispatcher and the address handlers.
//!
//! Binds one UDP socket, decodes each datagram with `rosc`, and handles
//! every message in its own task so a blocked add handshake never stalls
//! the receive loop. Every request gets exactly one reply — a `/reply`
//! carrying the originating address, or an `/error` carrying the
//! originating address, a numeric code, and a message.

use std::net::SocketAddr;
use std::sync::Arc;

use rosc::{OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::handshake::{executable_key, AnnounceCoordinator, HandshakeReply};
use crate::protocol::{self, Args};
use crate::session::registry::SessionRegistry;
use crate::session::Session;
use crate::supervisor::Supervisor;
use crate::{AppError, Result};

/// The server's own application name, sent in announce replies.
pub const SERVER_NAME: &str = "stagehand";
/// Capability tokens the server advertises.
pub const SERVER_CAPABILITIES: &[&str] = &["server-control"];

/// Maximum UDP payload the receive loop accepts.
const MAX_DATAGRAM: usize = 65_507;

/// The protocol dispatcher: socket, session registry, and handshake
/// coordinator.
pub struct Server {
    config: Config,
    socket: Arc<UdpSocket>,
    sessions: Arc<SessionRegistry>,
    coordinator: AnnounceCoordinator,
    supervisor: Supervisor,
}

impl Server {
    /// Bind the UDP socket and assemble the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the socket cannot be bound.
    pub async fn bind(
        config: Config,
        sessions: Arc<SessionRegistry>,
        supervisor: Supervisor,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(config.bind_addr())
            .await
            .map_err(|err| AppError::Io(format!("binding {}: {err}", config.bind_addr())))?;
        Ok(Arc::new(Self {
            config,
            socket: Arc::new(socket),
            sessions,
            coordinator: AnnounceCoordinator::new(),
            supervisor,
        }))
    }

    /// The socket address the server is listening on.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the local address cannot be resolved.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|err| AppError::Io(format!("resolving local address: {err}")))
    }

    /// Receive datagrams until the supervisor cancels, dispatching each
    /// decoded message in its own task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the socket read fails.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = tokio::select! {
                () = self.supervisor.cancelled() => {
                    info!("protocol dispatcher shutting down");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => received
                    .map_err(|err| AppError::Io(format!("udp receive: {err}")))?,
            };
            match rosc::decoder::decode_udp(&buf[..len]) {
                Ok((_, OscPacket::Message(msg))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.dispatch(msg, peer).await;
                    });
                }
                Ok((_, OscPacket::Bundle(_))) => {
                    warn!(%peer, "ignoring osc bundle");
                }
                Err(err) => {
                    warn!(%peer, %err, "undecodable datagram");
                }
            }
        }
    }

    async fn dispatch(&self, msg: OscMessage, peer: SocketAddr) {
        let address = msg.addr.clone();
        let args = Args::new(&msg.args);
        let result = match address.as_str() {
            protocol::ADDR_PING => self.handle_ping(peer).await,
            protocol::ADDR_SERVER_ADD => self.handle_add(&args, peer).await,
            protocol::ADDR_SERVER_ANNOUNCE => self.handle_announce(&args, peer).await,
            protocol::ADDR_SERVER_NEW => self.handle_new_session(&args, peer).await,
            protocol::ADDR_SERVER_REMOVE => self.handle_remove_session(&args, peer).await,
            protocol::ADDR_SERVER_CLIENTS => self.handle_list_clients(peer).await,
            protocol::ADDR_SERVER_SESSIONS => self.handle_list_sessions(peer).await,
            protocol::ADDR_SERVER_LOGS => self.handle_client_logs(&args, peer).await,
            // Replies from clients are informational.
            protocol::ADDR_REPLY => Ok(()),
            other => {
                warn!(address = other, %peer, "unrecognized address");
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(%address, %peer, %err, "request failed");
            if let Err(send_err) = self.send(protocol::error_reply(&address, &err), peer).await {
                warn!(%peer, %send_err, "error reply could not be sent");
            }
        }
    }

    async fn handle_ping(&self, peer: SocketAddr) -> Result<()> {
        self.send(
            OscMessage {
                addr: protocol::ADDR_PONG.to_owned(),
                args: Vec::new(),
            },
            peer,
        )
        .await
    }

    /// Spawn a client into the current session and block, bounded, until
    /// it announces. The requester's reply is the forwarded announce
    /// greeting, or a timeout error.
    async fn handle_add(&self, args: &Args<'_>, peer: SocketAddr) -> Result<()> {
        let session = self.current_session().await?;
        args.expect_len(2, "add")?;
        let program = args.string(1, "executable path")?;

        // Register before spawning so a fast client cannot announce into
        // a coordinator that is not listening yet.
        let key = executable_key(program);
        let pending = self.coordinator.register(&key);

        let announce_url = self.local_addr()?.to_string();
        let client_name = session.spawn_from(args, &announce_url).await?;

        let cancel = self.supervisor.cancel_token();
        let greeting = pending
            .wait(self.config.announce_timeout(), &cancel)
            .await
            .map_err(|err| match err {
                AppError::Timeout(msg) => {
                    AppError::Timeout(format!("client {client_name}: {msg}"))
                }
                other => other,
            })?;

        self.send(
            protocol::reply(
                protocol::ADDR_SERVER_ANNOUNCE,
                vec![
                    OscType::String(greeting.server_name),
                    OscType::String(greeting.capabilities),
                ],
            ),
            peer,
        )
        .await
    }

    /// Accept a client announcement: insert it into the current session's
    /// registry, reply to the announcing peer, then wake the matching add
    /// handler. The insert is visible under the registry lock before the
    /// add handler can observe success.
    async fn handle_announce(&self, args: &Args<'_>, peer: SocketAddr) -> Result<()> {
        let session = self.current_session().await?;
        let client = session.announce(args, peer)?;

        let capabilities = protocol::format_capabilities(SERVER_CAPABILITIES);
        self.send(
            protocol::reply(
                protocol::ADDR_SERVER_ANNOUNCE,
                vec![
                    OscType::String(SERVER_NAME.to_owned()),
                    OscType::String(capabilities.clone()),
                ],
            ),
            peer,
        )
        .await?;

        let delivered = self.coordinator.complete(
            &executable_key(&client.executable_name),
            &HandshakeReply {
                server_name: SERVER_NAME.to_owned(),
                capabilities,
            },
        );
        debug!(
            pid = client.pid,
            application = %client.application_name,
            delivered,
            "announce processed"
        );
        Ok(())
    }

    async fn handle_new_session(&self, args: &Args<'_>, peer: SocketAddr) -> Result<()> {
        args.expect_len(1, "new-session")?;
        let name = args.string(0, "session name")?;
        self.sessions.create(name).await?;
        self.send(
            protocol::reply(
                protocol::ADDR_SERVER_NEW,
                vec![OscType::String(format!("created session {name}"))],
            ),
            peer,
        )
        .await
    }

    async fn handle_remove_session(&self, args: &Args<'_>, peer: SocketAddr) -> Result<()> {
        args.expect_len(1, "remove-session")?;
        let name = args.string(0, "session name")?;
        self.sessions.remove(name).await?;
        self.send(
            protocol::reply(
                protocol::ADDR_SERVER_REMOVE,
                vec![OscType::String(format!("removed session {name}"))],
            ),
            peer,
        )
        .await
    }

    async fn handle_list_clients(&self, peer: SocketAddr) -> Result<()> {
        let session = self.current_session().await?;
        let mut clients: Vec<_> = session.clients().snapshot().into_values().collect();
        clients.sort_by_key(|client| client.pid);

        let mut payload = Vec::with_capacity(clients.len() * 6 + 1);
        payload.push(OscType::Int(
            i32::try_from(clients.len()).unwrap_or(i32::MAX),
        ));
        for client in clients {
            payload.push(OscType::String(client.application_name));
            payload.push(OscType::String(protocol::format_capabilities(
                &client
                    .capabilities
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>(),
            )));
            payload.push(OscType::String(client.executable_name));
            payload.push(OscType::Int(client.major));
            payload.push(OscType::Int(client.minor));
            payload.push(OscType::Int(client.pid));
        }
        self.send(protocol::reply(protocol::ADDR_SERVER_CLIENTS, payload), peer)
            .await
    }

    async fn handle_list_sessions(&self, peer: SocketAddr) -> Result<()> {
        let (names, current_index) = self.sessions.listing().await;
        let mut payload = Vec::with_capacity(names.len() + 2);
        payload.push(OscType::Int(i32::try_from(names.len()).unwrap_or(i32::MAX)));
        payload.push(OscType::Int(current_index));
        payload.extend(names.into_iter().map(OscType::String));
        self.send(
            protocol::reply(protocol::ADDR_SERVER_SESSIONS, payload),
            peer,
        )
        .await
    }

    async fn handle_client_logs(&self, args: &Args<'_>, peer: SocketAddr) -> Result<()> {
        args.expect_len(2, "client-logs")?;
        let client_name = args.string(0, "client name")?;
        let selector = args.int(1, "stream selector")?;

        let session = self.current_session().await?;
        let lines = session.logs(client_name, selector).await?;

        let mut payload = Vec::with_capacity(lines.len() + 2);
        payload.push(OscType::String(client_name.to_owned()));
        payload.push(OscType::Int(i32::try_from(lines.len()).unwrap_or(i32::MAX)));
        payload.extend(lines.into_iter().map(OscType::String));
        self.send(protocol::reply(protocol::ADDR_SERVER_LOGS, payload), peer)
            .await
    }

    async fn current_session(&self) -> Result<Arc<Session>> {
        self.sessions
            .current()
            .await
            .ok_or_else(|| AppError::NotFound("no current session".into()))
    }

    async fn send(&self, msg: OscMessage, peer: SocketAddr) -> Result<()> {
        let bytes = rosc::encoder::encode(&OscPacket::Message(msg))?;
        self.socket
            .send_to(&bytes, peer)
            .await
            .map_err(|err| AppError::Io(format!("sending to {peer}: {err}")))?;
        Ok(())
    }
}

// SFTP connection management

use crate::errors::TransferError;
use crate::protocol::Timeouts;
use ssh2::{Session, Sftp};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info, instrument};

/// Authenticated SSH session with an open SFTP channel
pub struct SftpConnection {
    session: Session,
    sftp: Sftp,
    _tcp: TcpStream,
}

impl SftpConnection {
    /// Establish an SFTP connection with password authentication
    #[instrument(skip(username, password, timeouts), fields(host = %host, port = %port))]
    pub fn connect(
        host: &str,
        port: u16,
        username: &str,
        password: &str,
        timeouts: Timeouts,
    ) -> Result<Self, TransferError> {
        info!(host = %host, port = %port, "Establishing SFTP connection");
        let address = format!("{}:{}", host, port);
        let failed = |reason: String| TransferError::ConnectionFailed {
            host: address.clone(),
            reason,
        };

        let addr = resolve(host, port).map_err(failed)?;

        let tcp = TcpStream::connect_timeout(&addr, timeouts.connect).map_err(|e| {
            error!(error = %e, host = %host, port = %port, "Failed to connect");
            failed(format!("Failed to connect: {}", e))
        })?;

        tcp.set_read_timeout(Some(timeouts.io))
            .map_err(|e| failed(format!("Failed to set read timeout: {}", e)))?;
        tcp.set_write_timeout(Some(timeouts.io))
            .map_err(|e| failed(format!("Failed to set write timeout: {}", e)))?;

        let mut session = Session::new().map_err(|e| {
            error!(error = %e, "Failed to create SSH session");
            failed(format!("Failed to create SSH session: {}", e))
        })?;

        session.set_tcp_stream(
            tcp.try_clone()
                .map_err(|e| failed(format!("Failed to clone TCP stream: {}", e)))?,
        );
        session.set_timeout(timeouts.io.as_millis().min(u32::MAX as u128) as u32);

        session.handshake().map_err(|e| {
            error!(error = %e, "SSH handshake failed");
            failed(format!("SSH handshake failed: {}", e))
        })?;

        log_host_key(&session);

        debug!(username = %username, "Authenticating with password");
        session.userauth_password(username, password).map_err(|e| {
            error!(error = %e, username = %username, "Password authentication failed");
            failed(format!(
                "Password authentication failed for user {}: {}",
                username, e
            ))
        })?;

        if !session.authenticated() {
            error!("Authentication failed - session not authenticated");
            return Err(failed("Authentication failed".to_string()));
        }

        let sftp = session.sftp().map_err(|e| {
            error!(error = %e, "Failed to open SFTP channel");
            failed(format!("Failed to open SFTP channel: {}", e))
        })?;

        info!("SFTP connection established successfully");
        Ok(Self {
            session,
            sftp,
            _tcp: tcp,
        })
    }

    pub fn sftp(&self) -> &Sftp {
        &self.sftp
    }

    /// Close the SSH session
    pub fn close(self) {
        if let Err(e) = self.session.disconnect(None, "transfer complete", None) {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, String> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("Failed to resolve host: {}", e))?
        .next()
        .ok_or_else(|| "Host resolved to no addresses".to_string())
}

/// Log the server host key fingerprint
fn log_host_key(session: &Session) {
    if let Some((_, host_key_type)) = session.host_key() {
        if let Some(hash_bytes) = session.host_key_hash(ssh2::HashType::Sha256) {
            let hash_hex = hash_bytes
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(":");
            info!(host_key_type = ?host_key_type, hash = %hash_hex, "Server host key");
        }
    }
}

// FTP backend
// Control-connection commands with binary RETR/STOR over suppaftp

use super::{required, Timeouts, TransferProtocol};
use crate::errors::TransferError;
use crate::models::{FileRecord, Host};
use async_trait::async_trait;
use std::io;
use std::net::ToSocketAddrs;
use std::path::Path;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_PORT: u16 = 21;

pub struct FtpProtocol {
    name: String,
    hostname: Option<String>,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    directory: Option<String>,
    timeouts: Timeouts,
    stream: Option<FtpStream>,
}

impl FtpProtocol {
    pub fn new(host: &Host, timeouts: Timeouts) -> Self {
        Self {
            name: host.name.clone(),
            hostname: host.host.clone(),
            port: host.port.unwrap_or(DEFAULT_PORT),
            username: host.username.clone(),
            password: host.password.clone(),
            directory: host.directory.clone(),
            timeouts,
            stream: None,
        }
    }

    fn stream(&mut self) -> Result<&mut FtpStream, TransferError> {
        let description = self.describe();
        self.stream
            .as_mut()
            .ok_or(TransferError::NotConnected(description))
    }

    /// Open the control connection, log in and enter the configured directory
    fn open(&self, hostname: &str, username: &str, password: &str) -> Result<FtpStream, String> {
        let addr = (hostname, self.port)
            .to_socket_addrs()
            .map_err(|e| format!("Failed to resolve host: {}", e))?
            .next()
            .ok_or_else(|| "Host resolved to no addresses".to_string())?;

        let mut stream = FtpStream::connect_timeout(addr, self.timeouts.connect)
            .map_err(|e| format!("Failed to connect: {}", e))?;
        stream
            .get_ref()
            .set_read_timeout(Some(self.timeouts.io))
            .map_err(|e| format!("Failed to set read timeout: {}", e))?;
        stream
            .get_ref()
            .set_write_timeout(Some(self.timeouts.io))
            .map_err(|e| format!("Failed to set write timeout: {}", e))?;

        stream
            .login(username, password)
            .map_err(|e| format!("Login failed for user {}: {}", username, e))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| format!("Failed to switch to binary mode: {}", e))?;

        if let Some(directory) = required(&self.directory) {
            stream
                .cwd(directory)
                .map_err(|e| format!("Failed to enter directory {}: {}", directory, e))?;
        }

        Ok(stream)
    }
}

/// Whether `name` is a directory: entering it succeeds
fn is_directory(stream: &mut FtpStream, name: &str) -> bool {
    if stream.cwd(name).is_ok() {
        if let Err(e) = stream.cdup() {
            warn!(error = %e, directory = %name, "Failed to leave probed directory");
        }
        true
    } else {
        false
    }
}

#[async_trait]
impl TransferProtocol for FtpProtocol {
    fn describe(&self) -> String {
        format!(
            "ftp://{}@{}:{}/{}",
            self.username.as_deref().unwrap_or(""),
            self.hostname.as_deref().unwrap_or(""),
            self.port,
            self.directory.as_deref().unwrap_or("").trim_start_matches('/')
        )
    }

    #[instrument(skip(self), fields(host = %self.name))]
    async fn connect(&mut self) -> Result<bool, TransferError> {
        let (Some(hostname), Some(username), Some(password)) = (
            required(&self.hostname),
            required(&self.username),
            required(&self.password),
        ) else {
            warn!(host = %self.name, "FTP host requires hostname, username and password");
            return Ok(false);
        };

        info!(host = %hostname, port = self.port, "Establishing FTP connection");
        match self.open(hostname, username, password) {
            Ok(stream) => {
                self.stream = Some(stream);
                info!("FTP connection established successfully");
                Ok(true)
            }
            Err(reason) => {
                error!(host = %hostname, port = self.port, reason = %reason, "FTP connection failed");
                Ok(false)
            }
        }
    }

    async fn list_remote(&mut self) -> Result<Vec<FileRecord>, TransferError> {
        let stream = self.stream()?;
        let names = stream
            .nlst(None)
            .map_err(|e| TransferError::remote("list", ".", e))?;

        let mut records = Vec::with_capacity(names.len());
        for entry in names {
            // Some servers return paths rather than bare names
            let name = entry.rsplit('/').next().unwrap_or(&entry).to_string();
            if name.is_empty() || name == "." || name == ".." || is_directory(stream, &name) {
                continue;
            }
            let size = stream.size(&name).ok().map(|s| s as u64);
            records.push(FileRecord::new(name).with_size(size));
        }
        debug!(count = records.len(), "Listed FTP directory");
        Ok(records)
    }

    async fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), TransferError> {
        let stream = self.stream()?;
        // RNTO overwrites on most servers
        if stream.size(to).is_ok() {
            return Err(TransferError::remote("rename", from, format!("{} already exists", to)));
        }
        stream
            .rename(from, to)
            .map_err(|e| TransferError::remote("rename", from, e))
    }

    async fn download(
        &mut self,
        remote_name: &str,
        local_path: &Path,
    ) -> Result<u64, TransferError> {
        let mut file = std::fs::File::create(local_path)?;
        self.stream()?
            .retr(remote_name, |reader| {
                io::copy(reader, &mut file).map_err(FtpError::ConnectionError)
            })
            .map_err(|e| TransferError::remote("download", remote_name, e))
    }

    async fn upload(&mut self, local_path: &Path, remote_name: &str) -> Result<u64, TransferError> {
        let mut file = std::fs::File::open(local_path)?;
        self.stream()?
            .put_file(remote_name, &mut file)
            .map_err(|e| TransferError::remote("upload", remote_name, e))
    }

    async fn delete_remote(&mut self, name: &str) -> Result<(), TransferError> {
        self.stream()?
            .rm(name)
            .map_err(|e| TransferError::remote("delete", name, e))
    }

    async fn disconnect(&mut self) -> Result<(), TransferError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.quit() {
                debug!(error = %e, "FTP QUIT failed");
            }
            debug!(host = %self.name, "FTP session closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostKind;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn host(port: u16) -> Host {
        Host {
            id: 2,
            name: "ftp-partner".to_string(),
            kind: HostKind::Ftp,
            host: Some("127.0.0.1".to_string()),
            port: Some(port),
            directory: None,
            share: None,
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            description: None,
        }
    }

    fn timeouts() -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(2),
            io: Duration::from_secs(2),
        }
    }

    /// Single-session passive-mode server that answers RETR with `content`
    fn serve_file(content: Vec<u8>) -> u16 {
        let control = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = control.local_addr().unwrap().port();

        std::thread::spawn(move || {
            let (socket, _) = control.accept().unwrap();
            let mut reader = BufReader::new(socket.try_clone().unwrap());
            let mut writer = socket;
            writer.write_all(b"220 ready\r\n").unwrap();

            let mut data: Option<TcpListener> = None;
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let verb = line.split_whitespace().next().unwrap_or("").to_ascii_uppercase();
                let reply = match verb.as_str() {
                    "USER" => "331 password required".to_string(),
                    "PASS" => "230 logged in".to_string(),
                    "TYPE" => "200 type set".to_string(),
                    "PASV" => {
                        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
                        let data_port = listener.local_addr().unwrap().port();
                        data = Some(listener);
                        format!(
                            "227 Entering Passive Mode (127,0,0,1,{},{})",
                            data_port >> 8,
                            data_port & 0xff
                        )
                    }
                    "RETR" => {
                        writer.write_all(b"150 opening data connection\r\n").unwrap();
                        let (mut conn, _) = data.take().unwrap().accept().unwrap();
                        conn.write_all(&content).unwrap();
                        drop(conn);
                        "226 transfer complete".to_string()
                    }
                    "QUIT" => {
                        writer.write_all(b"221 bye\r\n").unwrap();
                        break;
                    }
                    _ => "502 not implemented".to_string(),
                };
                writer.write_all(format!("{}\r\n", reply).as_bytes()).unwrap();
            }
        });

        port
    }

    #[tokio::test]
    async fn test_download_streams_to_local_file() {
        let content: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let port = serve_file(content.clone());
        let local = tempfile::tempdir().unwrap();
        let target = local.path().join("export.bin.processing");

        let mut protocol = FtpProtocol::new(&host(port), timeouts());
        assert!(protocol.connect().await.unwrap());
        let bytes = protocol.download("export.bin", &target).await.unwrap();
        protocol.disconnect().await.unwrap();

        assert_eq!(bytes, content.len() as u64);
        assert_eq!(std::fs::read(&target).unwrap(), content);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_returns_false() {
        let mut protocol = FtpProtocol::new(&host(1), timeouts());
        assert!(!protocol.connect().await.unwrap());
        assert!(matches!(
            protocol.delete_remote("a.txt").await,
            Err(TransferError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_without_hostname_returns_false() {
        let mut incomplete = host(21);
        incomplete.host = Some(" ".to_string());
        let mut protocol = FtpProtocol::new(&incomplete, timeouts());
        assert!(!protocol.connect().await.unwrap());
    }

    #[test]
    fn test_default_port() {
        let mut h = host(21);
        h.port = None;
        let protocol = FtpProtocol::new(&h, timeouts());
        assert_eq!(protocol.describe(), "ftp://user@127.0.0.1:21/");
    }

    #[tokio::test]
    #[ignore] // Requires FTP server on localhost:2121 (user/secret)
    async fn test_list_against_real_server() {
        let mut protocol = FtpProtocol::new(&host(2121), timeouts());
        assert!(protocol.connect().await.unwrap());
        protocol.list_remote().await.unwrap();
        protocol.disconnect().await.unwrap();
    }
}

//! Raw walsender connection to the source database
//!
//! Speaks the PostgreSQL frontend/backend protocol directly over TCP in
//! replication mode: startup, password authentication, `IDENTIFY_SYSTEM`,
//! `START_REPLICATION` and the CopyBoth stream that follows. Frontend
//! frames are built with `postgres-protocol`; backend frames are compact
//! enough to parse by hand.

use crate::buffer::{BufferReader, BufferWriter};
use crate::error::{CdcError, Result};
use crate::types::Lsn;
use bytes::{Bytes, BytesMut};
use postgres_protocol::message::frontend;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Backend authentication request codes
const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT: i32 = 3;
const AUTH_MD5: i32 = 5;
const AUTH_SASL: i32 = 10;

/// Result of `IDENTIFY_SYSTEM`
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: u32,
    /// Current write position of the source log
    pub xlog_pos: Lsn,
    pub dbname: Option<String>,
}

/// Connection parameters extracted from the configured connection string
struct ConnectParams {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    database: String,
}

impl ConnectParams {
    /// Parse a libpq-style connection string or URI. The heavy lifting is
    /// delegated to `tokio_postgres::Config`, which understands both forms.
    fn parse(connection_string: &str) -> Result<Self> {
        let config = tokio_postgres::Config::from_str(connection_string)
            .map_err(|e| CdcError::config(format!("invalid source connection string: {}", e)))?;

        let host = config
            .get_hosts()
            .iter()
            .find_map(|h| match h {
                tokio_postgres::config::Host::Tcp(host) => Some(host.clone()),
                #[allow(unreachable_patterns)]
                _ => None,
            })
            .ok_or_else(|| CdcError::config("source connection string has no TCP host"))?;
        let port = config.get_ports().first().copied().unwrap_or(5432);
        let user = config
            .get_user()
            .ok_or_else(|| CdcError::config("source connection string has no user"))?
            .to_string();
        let password = config
            .get_password()
            .map(|p| String::from_utf8_lossy(p).into_owned());
        let database = config
            .get_dbname()
            .unwrap_or(user.as_str())
            .to_string();

        Ok(Self {
            host,
            port,
            user,
            password,
            database,
        })
    }
}

/// A replication-mode connection, usable for walsender commands until
/// [`WalConnection::start_replication`] converts it into a stream.
pub struct WalConnection {
    stream: BufReader<TcpStream>,
}

impl WalConnection {
    /// Open a replication-mode connection and authenticate
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let params = ConnectParams::parse(connection_string)?;

        info!(
            host = %params.host,
            port = params.port,
            user = %params.user,
            database = %params.database,
            "Connecting to source in replication mode"
        );

        let tcp = TcpStream::connect((params.host.as_str(), params.port))
            .await
            .map_err(|e| CdcError::connection(format!("connect failed: {}", e)))?;
        let mut stream = BufReader::new(tcp);

        let startup_params = vec![
            ("user", params.user.as_str()),
            ("database", params.database.as_str()),
            ("replication", "database"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(startup_params.into_iter(), &mut buf)
            .map_err(|e| CdcError::connection(format!("startup encode failed: {}", e)))?;
        stream.write_all(&buf).await?;
        stream.flush().await?;

        let mut conn = Self { stream };
        conn.authenticate(&params).await?;
        conn.wait_ready().await?;

        info!("Replication connection established");
        Ok(conn)
    }

    async fn authenticate(&mut self, params: &ConnectParams) -> Result<()> {
        loop {
            let (tag, body) = self.read_frame().await?;
            match tag {
                b'R' => {
                    let mut reader = BufferReader::new(&body);
                    match reader.read_i32()? {
                        AUTH_OK => {
                            debug!("Authentication successful");
                            return Ok(());
                        }
                        AUTH_CLEARTEXT => {
                            let password = params.password.as_deref().ok_or_else(|| {
                                CdcError::connection("source requires a password, none configured")
                            })?;
                            self.send_password(password).await?;
                        }
                        AUTH_MD5 => {
                            let password = params.password.as_deref().ok_or_else(|| {
                                CdcError::connection("source requires a password, none configured")
                            })?;
                            let salt = reader.read_bytes(4)?;
                            let hashed = md5_password(&params.user, password, &salt);
                            self.send_password(&hashed).await?;
                        }
                        AUTH_SASL => {
                            return Err(CdcError::connection(
                                "SASL authentication is not supported; use md5 or trust",
                            ));
                        }
                        other => {
                            return Err(CdcError::connection(format!(
                                "unsupported authentication request: {}",
                                other
                            )));
                        }
                    }
                }
                b'E' => return Err(backend_error(&body)),
                // ParameterStatus / BackendKeyData / NoticeResponse
                b'S' | b'K' | b'N' => continue,
                other => {
                    return Err(CdcError::connection(format!(
                        "unexpected message during authentication: '{}'",
                        other as char
                    )));
                }
            }
        }
    }

    async fn send_password(&mut self, password: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        frontend::password_message(password.as_bytes(), &mut buf)
            .map_err(|e| CdcError::connection(format!("password encode failed: {}", e)))?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn wait_ready(&mut self) -> Result<()> {
        loop {
            let (tag, body) = self.read_frame().await?;
            match tag {
                b'Z' => return Ok(()),
                b'E' => return Err(backend_error(&body)),
                _ => continue,
            }
        }
    }

    /// Retrieve the source's identity and current log position
    pub async fn identify_system(&mut self) -> Result<SystemIdentity> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .first()
            .ok_or_else(|| CdcError::protocol("IDENTIFY_SYSTEM returned no rows"))?;

        let system_id = row
            .first()
            .and_then(|f| f.clone())
            .ok_or_else(|| CdcError::protocol("IDENTIFY_SYSTEM missing systemid"))?;
        let timeline = row
            .get(1)
            .and_then(|f| f.as_deref())
            .and_then(|f| f.parse::<u32>().ok())
            .ok_or_else(|| CdcError::protocol("IDENTIFY_SYSTEM missing timeline"))?;
        let xlog_pos = row
            .get(2)
            .and_then(|f| f.as_deref())
            .ok_or_else(|| CdcError::protocol("IDENTIFY_SYSTEM missing xlogpos"))?
            .parse::<Lsn>()?;
        let dbname = row.get(3).and_then(|f| f.clone());

        Ok(SystemIdentity {
            system_id,
            timeline,
            xlog_pos,
            dbname,
        })
    }

    /// Start logical replication on `slot` from `start`, consuming the
    /// connection into a [`WalStream`]
    pub async fn start_replication(
        mut self,
        slot: &str,
        start: Lsn,
        publication: &str,
    ) -> Result<WalStream> {
        let command = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            slot, start, publication
        );
        debug!(command = %command, "Starting replication");

        let mut buf = BytesMut::new();
        frontend::query(&command, &mut buf)
            .map_err(|e| CdcError::connection(format!("query encode failed: {}", e)))?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        loop {
            let (tag, body) = self.read_frame().await?;
            match tag {
                // CopyBothResponse
                b'W' => {
                    info!(slot = slot, start_lsn = %start, "Entered CopyBoth mode");
                    return Ok(WalStream {
                        stream: self.stream,
                    });
                }
                b'E' => return Err(backend_error(&body)),
                b'N' => continue,
                other => {
                    return Err(CdcError::protocol(format!(
                        "unexpected response to START_REPLICATION: '{}'",
                        other as char
                    )));
                }
            }
        }
    }

    /// Run a walsender command, collecting the data rows as text fields
    async fn simple_query(&mut self, command: &str) -> Result<Vec<Vec<Option<String>>>> {
        let mut buf = BytesMut::new();
        frontend::query(command, &mut buf)
            .map_err(|e| CdcError::connection(format!("query encode failed: {}", e)))?;
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        let mut rows = Vec::new();
        loop {
            let (tag, body) = self.read_frame().await?;
            match tag {
                b'D' => rows.push(parse_data_row(&body)?),
                b'Z' => return Ok(rows),
                b'E' => return Err(backend_error(&body)),
                // RowDescription / CommandComplete / NoticeResponse
                b'T' | b'C' | b'N' => continue,
                other => {
                    warn!("Ignoring unexpected message '{}' in query response", other as char);
                }
            }
        }
    }

    async fn read_frame(&mut self) -> Result<(u8, Vec<u8>)> {
        read_frame(&mut self.stream).await
    }
}

/// The CopyBoth stream carrying WAL data after `START_REPLICATION`
pub struct WalStream {
    stream: BufReader<TcpStream>,
}

impl WalStream {
    /// Receive the next copy-data payload.
    ///
    /// The deadline applies only to the arrival of the first byte, so a
    /// timeout can never desynchronize the frame stream. Returns `Ok(None)`
    /// when the deadline elapses with no traffic.
    pub async fn next_frame(&mut self, deadline: Duration) -> Result<Option<Bytes>> {
        let tag = match timeout(deadline, self.stream.read_u8()).await {
            Err(_) => return Ok(None),
            Ok(result) => {
                result.map_err(|e| CdcError::connection(format!("receive failed: {}", e)))?
            }
        };

        let len = self
            .stream
            .read_i32()
            .await
            .map_err(|e| CdcError::connection(format!("receive failed: {}", e)))?;
        if len < 4 {
            return Err(CdcError::protocol(format!("invalid frame length {}", len)));
        }
        let mut body = vec![0u8; len as usize - 4];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| CdcError::connection(format!("receive failed: {}", e)))?;

        match tag {
            // CopyData
            b'd' => Ok(Some(Bytes::from(body))),
            // CopyDone: the server is tearing the stream down
            b'c' => Err(CdcError::connection("server ended the replication stream")),
            b'E' => Err(backend_error(&body)),
            other => {
                debug!("Skipping unexpected stream message '{}'", other as char);
                Ok(None)
            }
        }
    }

    /// Send a standby status update frame wrapped in CopyData
    pub async fn send_status(&mut self, payload: Bytes) -> Result<()> {
        let mut frame = BufferWriter::with_capacity(5 + payload.len());
        frame.write_u8(b'd');
        frame.write_i32(payload.len() as i32 + 4);
        frame.write_bytes(&payload);

        self.stream
            .get_mut()
            .write_all(&frame.freeze())
            .await
            .map_err(|e| CdcError::connection(format!("status send failed: {}", e)))?;
        self.stream
            .get_mut()
            .flush()
            .await
            .map_err(|e| CdcError::connection(format!("status send failed: {}", e)))?;
        Ok(())
    }
}

async fn read_frame(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let tag = stream
        .read_u8()
        .await
        .map_err(|e| CdcError::connection(format!("read failed: {}", e)))?;
    let len = stream
        .read_i32()
        .await
        .map_err(|e| CdcError::connection(format!("read failed: {}", e)))?;
    if len < 4 {
        return Err(CdcError::protocol(format!("invalid frame length {}", len)));
    }
    let mut body = vec![0u8; len as usize - 4];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| CdcError::connection(format!("read failed: {}", e)))?;
    Ok((tag, body))
}

/// Parse a DataRow body into nullable text fields
fn parse_data_row(body: &[u8]) -> Result<Vec<Option<String>>> {
    let mut reader = BufferReader::new(body);
    let field_count = reader.read_u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);

    for _ in 0..field_count {
        let len = reader.read_i32()?;
        if len < 0 {
            fields.push(None);
        } else {
            let raw = reader.read_bytes(len as usize)?;
            fields.push(Some(String::from_utf8_lossy(&raw).into_owned()));
        }
    }
    Ok(fields)
}

/// Turn an ErrorResponse body into a connection error
fn backend_error(body: &[u8]) -> CdcError {
    let mut severity = String::new();
    let mut message = String::new();
    let mut reader = BufferReader::new(body);

    while let Ok(field_type) = reader.read_u8() {
        if field_type == 0 {
            break;
        }
        let Ok(value) = reader.read_cstring() else {
            break;
        };
        match field_type {
            b'S' => severity = value,
            b'M' => message = value,
            _ => {}
        }
    }

    if message.is_empty() {
        CdcError::connection("server returned an error response")
    } else if severity.is_empty() {
        CdcError::connection(message)
    } else {
        CdcError::connection(format!("{}: {}", severity, message))
    }
}

/// md5 password response: md5(md5(password + user) + salt), hex-encoded
fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let inner_hex = hex::encode(inner.0);

    let mut outer_input = inner_hex.into_bytes();
    outer_input.extend_from_slice(salt);
    let outer = md5::compute(&outer_input);

    format!("md5{}", hex::encode(outer.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password_shape() {
        let hashed = md5_password("bob", "secret", &[1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 3 + 32);
        // Stable for fixed inputs
        assert_eq!(hashed, md5_password("bob", "secret", &[1, 2, 3, 4]));
        assert_ne!(hashed, md5_password("bob", "secret", &[4, 3, 2, 1]));
    }

    #[test]
    fn test_parse_data_row() {
        let mut body = Vec::new();
        body.extend_from_slice(&3u16.to_be_bytes());
        body.extend_from_slice(&4i32.to_be_bytes());
        body.extend_from_slice(b"abcd");
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0i32.to_be_bytes());

        let fields = parse_data_row(&body).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].as_deref(), Some("abcd"));
        assert!(fields[1].is_none());
        assert_eq!(fields[2].as_deref(), Some(""));
    }

    #[test]
    fn test_backend_error_extracts_message() {
        let mut body = Vec::new();
        body.push(b'S');
        body.extend_from_slice(b"ERROR\x00");
        body.push(b'M');
        body.extend_from_slice(b"relation does not exist\x00");
        body.push(0);

        let err = backend_error(&body);
        let rendered = err.to_string();
        assert!(rendered.contains("ERROR"));
        assert!(rendered.contains("relation does not exist"));
    }

    #[test]
    fn test_connect_params_from_uri() {
        let params =
            ConnectParams::parse("postgres://repl:pw@db.internal:6432/appdb").unwrap();
        assert_eq!(params.host, "db.internal");
        assert_eq!(params.port, 6432);
        assert_eq!(params.user, "repl");
        assert_eq!(params.password.as_deref(), Some("pw"));
        assert_eq!(params.database, "appdb");
    }

    #[test]
    fn test_connect_params_from_keyword_form() {
        let params =
            ConnectParams::parse("host=localhost user=postgres dbname=postgres").unwrap();
        assert_eq!(params.host, "localhost");
        assert_eq!(params.port, 5432);
        assert_eq!(params.user, "postgres");
        assert!(params.password.is_none());
    }

    #[test]
    fn test_connect_params_rejects_garbage() {
        assert!(ConnectParams::parse("this is not a connection string =").is_err());
    }
}

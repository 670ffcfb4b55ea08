/// Physical database connection
///
/// Opens the TCP stream, runs the handshake and authentication, then issues
/// text-protocol commands over the packet stream.
use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::{GlobalStateInfo, HostAddress};
use crate::auth::{self, AuthOptions, Credentials};
use crate::error::{DriverError, DriverResult};
use crate::protocol::command::{COM_INIT_DB, COM_PING, COM_QUERY, COM_QUIT};
use crate::protocol::handshake::InitialHandshake;
use crate::protocol::message::{
    decode_text_row, is_eof, ColumnDefinition, ErrPacket, OkPacket, QueryResult,
};
use crate::protocol::{header, status, PacketStream, Transport, WireReader};

/// MySQL's hard limit on columns per table, and so per result set
const MAX_COLUMNS: u64 = 4096;

/// Settings used for every physical connection of a pool
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub credentials: Credentials,
    pub auth: AuthOptions,
    pub connect_timeout: Duration,
    pub socket_timeout: Option<Duration>,
    pub tcp_keep_alive: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            auth: AuthOptions::default(),
            connect_timeout: Duration::from_secs(30),
            socket_timeout: None,
            tcp_keep_alive: true,
        }
    }
}

/// One authenticated session with a server
pub struct Connection<T = TcpStream> {
    stream: PacketStream<T>,
    host: HostAddress,
    server_version: String,
    connection_id: u32,
    status_flags: u16,
    transaction_isolation_variable: bool,
    broken: bool,
    created_at: Instant,
}

impl Connection<TcpStream> {
    /// Connect to `host` and authenticate, bounded by the connect timeout
    pub async fn connect(host: &HostAddress, options: &ConnectionOptions) -> DriverResult<Self> {
        debug!("Connecting to {}", host);
        let addr = host.socket_addr_string();

        let stream = match timeout(options.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Network error connecting to {}: {}", host, e);
                return Err(e.into());
            }
            Err(_) => {
                debug!("Timeout connecting to {}", host);
                return Err(DriverError::timeout(format!(
                    "connect to {} after {:?}",
                    host, options.connect_timeout
                )));
            }
        };

        if let Err(e) = configure_stream(&stream, options.tcp_keep_alive) {
            warn!("Failed to configure stream to {}: {}", host, e);
        }

        match timeout(
            options.connect_timeout,
            Self::handshake(stream, host.clone(), options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DriverError::timeout(format!("handshake with {host}"))),
        }
    }
}

fn configure_stream(stream: &TcpStream, keep_alive: bool) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if keep_alive {
        SockRef::from(stream).set_keepalive(true)?;
    }
    Ok(())
}

impl<T: Transport> Connection<T> {
    /// Run the connection phase over an already-open transport
    pub async fn handshake(
        transport: T,
        host: HostAddress,
        options: &ConnectionOptions,
    ) -> DriverResult<Self> {
        let mut stream = PacketStream::new(transport).with_socket_timeout(options.socket_timeout);

        let handshake = InitialHandshake::parse(stream.get_packet().await?)?;
        debug!(
            "Server {} version {} (connection id {})",
            host, handshake.server_version, handshake.connection_id
        );

        let ok = auth::authenticate(&mut stream, &handshake, &options.credentials, &options.auth)
            .await?;

        let transaction_isolation_variable =
            !handshake.is_mariadb() && handshake.version_at_least(8, 0, 3);

        Ok(Self {
            stream,
            host,
            server_version: handshake.server_version,
            connection_id: handshake.connection_id,
            status_flags: ok.status_flags,
            transaction_isolation_variable,
            broken: false,
            created_at: Instant::now(),
        })
    }

    pub fn host(&self) -> &HostAddress {
        &self.host
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    pub fn autocommit(&self) -> bool {
        self.status_flags & status::AUTOCOMMIT != 0
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & status::IN_TRANSACTION != 0
    }

    /// Whether a previous error left the session unusable
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn set_max_allowed_packet(&mut self, max: u64) {
        self.stream
            .set_max_allowed_packet(Some(usize::try_from(max).unwrap_or(usize::MAX)));
    }

    fn track<R>(&mut self, result: DriverResult<R>) -> DriverResult<R> {
        if let Err(e) = &result {
            if e.is_fatal_to_connection() {
                debug!("Connection {} to {} broken: {}", self.connection_id, self.host, e);
                self.broken = true;
            }
        }
        result
    }

    async fn send_command(&mut self, command: u8, payload: &[u8]) -> DriverResult<()> {
        if self.broken {
            return Err(DriverError::ConnectionAborted);
        }
        self.stream.start_packet(0);
        self.stream.writer().write_u8(command);
        self.stream.write(payload);
        self.stream.flush().await
    }

    /// Run a text-protocol statement and decode its result
    pub async fn query(&mut self, sql: &str) -> DriverResult<QueryResult> {
        trace!("Query on connection {}: {}", self.connection_id, sql);
        let result: DriverResult<QueryResult> = async {
            self.send_command(COM_QUERY, sql.as_bytes()).await?;
            self.read_query_result().await
        }
        .await;
        self.track(result)
    }

    async fn read_query_result(&mut self) -> DriverResult<QueryResult> {
        let mut first: Option<QueryResult> = None;
        loop {
            let result = self.read_one_result().await?;
            let more = result.status_flags & status::MORE_RESULTS_EXISTS != 0;
            if first.is_none() {
                first = Some(result);
            }
            if !more {
                break;
            }
        }
        first.ok_or_else(|| DriverError::internal("query produced no result"))
    }

    async fn read_one_result(&mut self) -> DriverResult<QueryResult> {
        let packet = self.stream.get_packet().await?;
        match packet.first().copied() {
            Some(header::OK) => {
                let ok = OkPacket::decode(packet)?;
                self.status_flags = ok.status_flags;
                Ok(QueryResult::from_ok(ok))
            }
            Some(header::ERR) => Err(ErrPacket::decode(packet)?.into()),
            Some(header::LOCAL_INFILE) => Err(DriverError::protocol(
                "LOCAL INFILE requests are not supported",
            )),
            Some(_) => self.read_result_set(packet).await,
            None => Err(DriverError::protocol("empty query response")),
        }
    }

    async fn read_result_set(&mut self, count_packet: Bytes) -> DriverResult<QueryResult> {
        let count = WireReader::new(count_packet)
            .read_lenenc_int()?
            .ok_or_else(|| DriverError::protocol("NULL column count"))?;
        if count > MAX_COLUMNS {
            return Err(DriverError::protocol(format!(
                "column count {count} exceeds {MAX_COLUMNS}"
            )));
        }

        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            columns.push(ColumnDefinition::decode(self.stream.get_packet().await?)?);
        }
        let eof = self.stream.get_packet().await?;
        if !is_eof(&eof) {
            return Err(DriverError::protocol("expected EOF after column definitions"));
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.stream.get_packet().await?;
            if is_eof(&packet) {
                let mut reader = WireReader::new(packet);
                reader.skip(1)?;
                let warnings = reader.read_u16()?;
                self.status_flags = reader.read_u16()?;
                return Ok(QueryResult {
                    columns,
                    rows,
                    warnings,
                    status_flags: self.status_flags,
                    ..Default::default()
                });
            }
            if packet.first() == Some(&header::ERR) {
                return Err(ErrPacket::decode(packet)?.into());
            }
            rows.push(decode_text_row(packet, &columns)?);
        }
    }

    async fn simple_command(&mut self, command: u8, payload: &[u8]) -> DriverResult<OkPacket> {
        let result: DriverResult<OkPacket> = async {
            self.send_command(command, payload).await?;
            let packet = self.stream.get_packet().await?;
            match packet.first().copied() {
                Some(header::OK) => OkPacket::decode(packet),
                Some(header::ERR) => Err(ErrPacket::decode(packet)?.into()),
                Some(other) => Err(DriverError::protocol(format!(
                    "unexpected response header 0x{other:02x}"
                ))),
                None => Err(DriverError::protocol("empty response")),
            }
        }
        .await;
        let ok = self.track(result)?;
        self.status_flags = ok.status_flags;
        Ok(ok)
    }

    /// `COM_PING`
    pub async fn ping(&mut self) -> DriverResult<()> {
        self.simple_command(COM_PING, &[]).await.map(|_| ())
    }

    /// `COM_INIT_DB`
    pub async fn select_db(&mut self, database: &str) -> DriverResult<()> {
        self.simple_command(COM_INIT_DB, database.as_bytes())
            .await
            .map(|_| ())
    }

    pub async fn set_autocommit(&mut self, autocommit: bool) -> DriverResult<()> {
        let sql = if autocommit {
            "SET autocommit=1"
        } else {
            "SET autocommit=0"
        };
        self.query(sql).await.map(|_| ())
    }

    pub async fn commit(&mut self) -> DriverResult<()> {
        self.query("COMMIT").await.map(|_| ())
    }

    pub async fn rollback(&mut self) -> DriverResult<()> {
        self.query("ROLLBACK").await.map(|_| ())
    }

    /// Read the server's session defaults
    pub async fn fetch_global_state(&mut self) -> DriverResult<GlobalStateInfo> {
        let result = self
            .query(&GlobalStateInfo::query(self.transaction_isolation_variable))
            .await?;
        let row = result
            .first_row()
            .ok_or_else(|| DriverError::protocol("global state query returned no row"))?;
        GlobalStateInfo::from_row(row)
    }

    /// Send `COM_QUIT` and close the transport
    pub async fn quit(mut self) -> DriverResult<()> {
        debug!("Closing connection {} to {}", self.connection_id, self.host);
        if !self.broken {
            self.send_command(COM_QUIT, &[]).await?;
        }
        self.stream.close().await
    }
}

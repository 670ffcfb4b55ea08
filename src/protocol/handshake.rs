//! Connection-phase messages: initial handshake, handshake response and
//! authentication switch request

use bytes::Bytes;

use super::buffer::{WireReader, WireWriter};
use super::capabilities;
use super::message::ErrPacket;
use super::{header, DEFAULT_COLLATION, MAX_PACKET_SIZE};
use crate::error::{DriverError, DriverResult};

/// Initial handshake (protocol version 10) sent by the server
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Authentication seed, both parts joined, trailing NUL removed
    pub seed: Vec<u8>,
    pub capabilities: u64,
    pub collation: u8,
    pub status_flags: u16,
    pub auth_plugin: Option<String>,
}

impl InitialHandshake {
    pub fn parse(payload: Bytes) -> DriverResult<Self> {
        let mut reader = WireReader::new(payload);

        let protocol_version = reader.read_u8()?;
        if protocol_version == header::ERR {
            return Err(ErrPacket::decode_body(&mut reader)?.into());
        }
        if protocol_version != 10 {
            return Err(DriverError::protocol(format!(
                "unsupported protocol version {protocol_version}"
            )));
        }

        let server_version = reader.read_null_terminated_string()?;
        let connection_id = reader.read_u32()?;
        let mut seed = reader.read_bytes(8)?.to_vec();
        reader.skip(1)?;

        let mut capabilities = u64::from(reader.read_u16()?);
        let collation = reader.read_u8()?;
        let status_flags = reader.read_u16()?;
        capabilities |= u64::from(reader.read_u16()?) << 16;
        let seed_length = usize::from(reader.read_u8()?);

        // 6 reserved bytes, then MariaDB extended capabilities (or 4 more reserved)
        reader.skip(6)?;
        let extended = u64::from(reader.read_u32()?);
        if capabilities & capabilities::CLIENT_MYSQL == 0 {
            capabilities |= extended << 32;
        }

        if capabilities & capabilities::SECURE_CONNECTION != 0 {
            let part2_length = seed_length.saturating_sub(9).max(12);
            seed.extend_from_slice(&reader.read_bytes(part2_length)?);
            // trailing NUL of the second seed part
            if reader.peek_u8() == Some(0) {
                reader.skip(1)?;
            }
        }

        let auth_plugin = if capabilities & capabilities::PLUGIN_AUTH != 0 && !reader.is_empty() {
            Some(reader.read_null_terminated_string()?)
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            seed,
            capabilities,
            collation,
            status_flags,
            auth_plugin,
        })
    }

    pub fn is_mariadb(&self) -> bool {
        self.server_version.contains("MariaDB")
    }

    /// `(major, minor, patch)` parsed from the version string
    pub fn version(&self) -> (u32, u32, u32) {
        let version = self
            .server_version
            .strip_prefix("5.5.5-")
            .unwrap_or(&self.server_version);
        let mut parts = version
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<u32>().unwrap_or(0));
        (
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        )
    }

    pub fn version_at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        self.version() >= (major, minor, patch)
    }
}

/// HandshakeResponse41 sent by the client
#[derive(Debug, Clone)]
pub struct HandshakeResponse<'a> {
    pub capabilities: u64,
    pub collation: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
}

impl HandshakeResponse<'_> {
    /// Client capabilities: the driver defaults intersected with the server's
    pub fn negotiate_capabilities(server: u64, database: Option<&str>) -> u64 {
        let mut wanted = capabilities::DEFAULT;
        if database.is_some() {
            wanted |= capabilities::CONNECT_WITH_DB;
        }
        wanted & server
    }

    pub fn encode(&self, writer: &mut WireWriter) {
        writer.write_u32(self.capabilities as u32);
        writer.write_u32(MAX_PACKET_SIZE as u32);
        writer.write_u8(if self.collation == 0 {
            DEFAULT_COLLATION
        } else {
            self.collation
        });
        writer.write_zeros(19);
        writer.write_u32((self.capabilities >> 32) as u32);
        writer.write_null_terminated(self.user.as_bytes());

        if self.capabilities & capabilities::PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            writer.write_lenenc_bytes(self.auth_response);
        } else if self.capabilities & capabilities::SECURE_CONNECTION != 0 {
            writer.write_u8(self.auth_response.len().min(255) as u8);
            writer.write_bytes(&self.auth_response[..self.auth_response.len().min(255)]);
        } else {
            writer.write_null_terminated(self.auth_response);
        }

        if self.capabilities & capabilities::CONNECT_WITH_DB != 0 {
            if let Some(database) = self.database {
                writer.write_null_terminated(database.as_bytes());
            }
        }

        if self.capabilities & capabilities::PLUGIN_AUTH != 0 {
            writer.write_null_terminated(self.auth_plugin.as_bytes());
        }
    }
}

/// Authentication method switch requested by the server (`0xFE` header)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub seed: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: Bytes) -> DriverResult<Self> {
        let mut reader = WireReader::new(payload);
        let marker = reader.read_u8()?;
        if marker != header::EOF {
            return Err(DriverError::protocol(format!(
                "expected auth switch request, got header 0x{marker:02x}"
            )));
        }
        let plugin = reader.read_null_terminated_string()?;
        let mut seed = reader.read_rest().to_vec();
        if seed.last() == Some(&0) {
            seed.pop();
        }
        Ok(Self { plugin, seed })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a v10 handshake payload the way a MySQL 8 server sends it
    pub(crate) fn handshake_payload(server_version: &str, plugin: &str, seed: &[u8; 20]) -> Vec<u8> {
        let caps = capabilities::DEFAULT | capabilities::CONNECT_WITH_DB;
        let mut writer = WireWriter::new();
        writer.write_u8(10);
        writer.write_null_terminated(server_version.as_bytes());
        writer.write_u32(42);
        writer.write_bytes(&seed[..8]);
        writer.write_u8(0);
        writer.write_u16(caps as u16);
        writer.write_u8(DEFAULT_COLLATION);
        writer.write_u16(2);
        writer.write_u16((caps >> 16) as u16);
        writer.write_u8(21);
        writer.write_zeros(10);
        writer.write_bytes(&seed[8..]);
        writer.write_u8(0);
        writer.write_null_terminated(plugin.as_bytes());
        writer.as_slice().to_vec()
    }

    fn seed() -> [u8; 20] {
        let mut seed = [0u8; 20];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8 + 1;
        }
        seed
    }

    #[test]
    fn test_parse_initial_handshake() {
        let payload = handshake_payload("8.0.36", "caching_sha2_password", &seed());
        let handshake = InitialHandshake::parse(Bytes::from(payload)).unwrap();

        assert_eq!(handshake.protocol_version, 10);
        assert_eq!(handshake.server_version, "8.0.36");
        assert_eq!(handshake.connection_id, 42);
        assert_eq!(handshake.seed, seed().to_vec());
        assert_eq!(handshake.auth_plugin.as_deref(), Some("caching_sha2_password"));
        assert!(handshake.capabilities & capabilities::PLUGIN_AUTH != 0);
        assert!(!handshake.is_mariadb());
        assert!(handshake.version_at_least(8, 0, 3));
    }

    #[test]
    fn test_mariadb_version_prefix() {
        let payload = handshake_payload("5.5.5-10.11.6-MariaDB", "mysql_native_password", &seed());
        let handshake = InitialHandshake::parse(Bytes::from(payload)).unwrap();
        assert!(handshake.is_mariadb());
        assert_eq!(handshake.version(), (10, 11, 6));
    }

    #[test]
    fn test_handshake_error_packet() {
        let mut writer = WireWriter::new();
        writer.write_u8(0xFF);
        writer.write_u16(1040);
        writer.write_bytes(b"Too many connections");
        let err = InitialHandshake::parse(writer.freeze()).unwrap_err();
        assert!(matches!(err, DriverError::Server { code: 1040, .. }));
    }

    #[test]
    fn test_encode_handshake_response() {
        let caps = HandshakeResponse::negotiate_capabilities(capabilities::DEFAULT, Some("app"));
        // server did not offer CONNECT_WITH_DB
        assert_eq!(caps & capabilities::CONNECT_WITH_DB, 0);

        let caps = caps | capabilities::CONNECT_WITH_DB;
        let response = HandshakeResponse {
            capabilities: caps,
            collation: 0,
            user: "root",
            auth_response: &[0xAA, 0xBB],
            database: Some("app"),
            auth_plugin: "mysql_native_password",
        };
        let mut writer = WireWriter::new();
        response.encode(&mut writer);

        let mut reader = WireReader::new(writer.freeze());
        assert_eq!(u64::from(reader.read_u32().unwrap()), caps & 0xFFFF_FFFF);
        assert_eq!(reader.read_u32().unwrap(), MAX_PACKET_SIZE as u32);
        assert_eq!(reader.read_u8().unwrap(), DEFAULT_COLLATION);
        reader.skip(23).unwrap();
        assert_eq!(reader.read_null_terminated_string().unwrap(), "root");
        assert_eq!(
            reader.read_lenenc_bytes().unwrap().unwrap(),
            Bytes::from_static(&[0xAA, 0xBB])
        );
        assert_eq!(reader.read_null_terminated_string().unwrap(), "app");
        assert_eq!(
            reader.read_null_terminated_string().unwrap(),
            "mysql_native_password"
        );
        assert!(reader.is_empty());
    }

    #[test]
    fn test_parse_auth_switch() {
        let mut payload = vec![0xFE];
        payload.extend_from_slice(b"client_ed25519\0");
        payload.extend_from_slice(&[7u8; 32]);
        payload.push(0);
        let switch = AuthSwitchRequest::parse(Bytes::from(payload)).unwrap();
        assert_eq!(switch.plugin, "client_ed25519");
        assert_eq!(switch.seed, vec![7u8; 32]);
    }
}

/// Authentication plugins and the connection-phase state machine
pub mod ed25519;
pub mod scramble;

use std::fmt;

use bytes::Bytes;
use tracing::debug;

use crate::error::{AuthError, DriverError, DriverResult};
use crate::protocol::buffer::WireReader;
use crate::protocol::handshake::{AuthSwitchRequest, HandshakeResponse, InitialHandshake};
use crate::protocol::message::{ErrPacket, OkPacket};
use crate::protocol::{header, PacketStream, Transport};

const REQUEST_PUBLIC_KEY: u8 = 0x02;
const FAST_AUTH_SUCCESS: u8 = 0x03;
const PERFORM_FULL_AUTHENTICATION: u8 = 0x04;
const MAX_AUTH_ROUNDS: usize = 8;

/// Authentication methods the driver can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    /// `mysql_clear_password`
    ClearText,
    /// `mysql_native_password`
    NativePassword,
    /// `caching_sha2_password`
    CachingSha2,
    /// `client_ed25519`
    Ed25519,
}

impl AuthPlugin {
    pub fn from_name(name: &str) -> DriverResult<Self> {
        match name {
            "mysql_clear_password" => Ok(AuthPlugin::ClearText),
            "mysql_native_password" => Ok(AuthPlugin::NativePassword),
            "caching_sha2_password" => Ok(AuthPlugin::CachingSha2),
            "client_ed25519" => Ok(AuthPlugin::Ed25519),
            other => Err(AuthError::UnsupportedPlugin(other.to_string()).into()),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AuthPlugin::ClearText => "mysql_clear_password",
            AuthPlugin::NativePassword => "mysql_native_password",
            AuthPlugin::CachingSha2 => "caching_sha2_password",
            AuthPlugin::Ed25519 => "client_ed25519",
        }
    }

    /// Bytes this method answers a seed with. An empty vector means "no credential".
    pub fn response(self, password: Option<&str>, seed: &[u8], encrypted: bool) -> DriverResult<Vec<u8>> {
        let password = match password {
            Some(p) if !p.is_empty() => p.as_bytes(),
            _ => return Ok(Vec::new()),
        };
        match self {
            AuthPlugin::ClearText => {
                if !encrypted {
                    return Err(AuthError::CleartextOverInsecureChannel.into());
                }
                let mut data = password.to_vec();
                data.push(0);
                Ok(data)
            }
            AuthPlugin::NativePassword => scramble::native_password(password, seed),
            AuthPlugin::CachingSha2 => scramble::caching_sha2(password, seed),
            AuthPlugin::Ed25519 => Ok(ed25519::sign(seed, password).to_vec()),
        }
    }
}

impl fmt::Display for AuthPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity presented to the server
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
}

/// Options governing RSA password exchange
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    /// PEM file path or inline PEM text
    pub server_rsa_public_key: Option<String>,
    pub allow_public_key_retrieval: bool,
}

/// Run the connection-phase exchange after the initial handshake has been read.
///
/// Sends the handshake response, follows auth switch and `caching_sha2`
/// continuation requests, and interprets the final OK or ERR packet.
pub async fn authenticate<T: Transport>(
    stream: &mut PacketStream<T>,
    handshake: &InitialHandshake,
    credentials: &Credentials,
    options: &AuthOptions,
) -> DriverResult<OkPacket> {
    let password = credentials.password.as_deref();
    let encrypted = stream.is_encrypted();

    // an unknown default plugin is answered with native scrambling; the server switches
    let mut plugin = handshake
        .auth_plugin
        .as_deref()
        .and_then(|name| AuthPlugin::from_name(name).ok())
        .unwrap_or(AuthPlugin::NativePassword);
    let mut seed = handshake.seed.clone();

    let initial = plugin.response(password, &seed, encrypted)?;
    let database = credentials.database.as_deref();
    let response = HandshakeResponse {
        capabilities: HandshakeResponse::negotiate_capabilities(handshake.capabilities, database),
        collation: 0,
        user: &credentials.user,
        auth_response: &initial,
        database,
        auth_plugin: plugin.name(),
    };
    let sequence = stream.sequence();
    stream.start_packet(sequence);
    response.encode(stream.writer());
    stream.flush().await?;
    debug!(user = %credentials.user, plugin = %plugin, "sent handshake response");

    let mut packet = stream.get_packet().await?;
    for _ in 0..MAX_AUTH_ROUNDS {
        match packet.first().copied() {
            Some(header::OK) => return OkPacket::decode(packet),
            Some(header::ERR) => return Err(ErrPacket::decode(packet)?.into()),
            Some(header::EOF) => {
                let switch = AuthSwitchRequest::parse(packet)?;
                plugin = AuthPlugin::from_name(&switch.plugin)?;
                seed = switch.seed;
                debug!(plugin = %plugin, "server requested authentication switch");
                packet = process(stream, plugin, password, &seed, options).await?;
            }
            Some(header::AUTH_MORE_DATA) if plugin == AuthPlugin::CachingSha2 => {
                packet = continue_caching_sha2(stream, packet, password, &seed, options).await?;
            }
            Some(other) => return Err(AuthError::UnexpectedResponse(other).into()),
            None => return Err(DriverError::protocol("empty authentication response")),
        }
    }
    Err(DriverError::protocol("too many authentication round trips"))
}

/// Execute one authentication method and return the next server packet
pub async fn process<T: Transport>(
    stream: &mut PacketStream<T>,
    plugin: AuthPlugin,
    password: Option<&str>,
    seed: &[u8],
    options: &AuthOptions,
) -> DriverResult<Bytes> {
    let data = plugin.response(password, seed, stream.is_encrypted())?;
    let sequence = stream.sequence();
    if data.is_empty() {
        stream.write_empty_packet(sequence).await?;
    } else {
        stream.start_packet(sequence);
        stream.write(&data);
        stream.flush().await?;
    }

    let packet = stream.get_packet().await?;
    if plugin == AuthPlugin::CachingSha2 && packet.first() == Some(&header::AUTH_MORE_DATA) {
        return continue_caching_sha2(stream, packet, password, seed, options).await;
    }
    Ok(packet)
}

/// Handle the `0x01`-headed status byte that follows a `caching_sha2` scramble
async fn continue_caching_sha2<T: Transport>(
    stream: &mut PacketStream<T>,
    packet: Bytes,
    password: Option<&str>,
    seed: &[u8],
    options: &AuthOptions,
) -> DriverResult<Bytes> {
    let mut reader = WireReader::new(packet);
    reader.skip(1)?;
    match reader.read_u8()? {
        FAST_AUTH_SUCCESS => {
            debug!("caching_sha2 fast authentication succeeded");
            stream.get_packet().await
        }
        PERFORM_FULL_AUTHENTICATION => {
            let password = password.unwrap_or_default().as_bytes();
            let sequence = stream.sequence();
            if stream.is_encrypted() {
                let mut data = password.to_vec();
                data.push(0);
                stream.start_packet(sequence);
                stream.write(&data);
                stream.flush().await?;
            } else {
                let pem = match options.server_rsa_public_key.as_deref() {
                    Some(key) => load_public_key(key).await?,
                    None if options.allow_public_key_retrieval => {
                        stream.start_packet(sequence);
                        stream.write(&[REQUEST_PUBLIC_KEY]);
                        stream.flush().await?;
                        let mut reply = WireReader::new(stream.get_packet().await?);
                        if reply.read_u8()? != header::AUTH_MORE_DATA {
                            return Err(DriverError::protocol(
                                "expected public key from server",
                            ));
                        }
                        String::from_utf8_lossy(&reply.read_rest()).into_owned()
                    }
                    None => return Err(AuthError::PublicKeyRetrievalNotAllowed.into()),
                };
                debug!("caching_sha2 full authentication with RSA public key");
                let encrypted = scramble::encrypt_password(password, seed, &pem)?;
                let sequence = stream.sequence();
                stream.start_packet(sequence);
                stream.write(&encrypted);
                stream.flush().await?;
            }
            stream.get_packet().await
        }
        other => Err(AuthError::UnexpectedResponse(other).into()),
    }
}

/// Inline PEM text is used as-is, anything else is read as a file path
async fn load_public_key(key: &str) -> DriverResult<String> {
    if key.trim_start().starts_with("-----BEGIN") {
        return Ok(key.to_string());
    }
    let pem = tokio::fs::read_to_string(key)
        .await
        .map_err(|e| AuthError::InvalidPublicKey(format!("cannot read '{key}': {e}")))?;
    if pem.trim().is_empty() {
        return Err(AuthError::MissingPublicKey.into());
    }
    Ok(pem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::scramble::tests::{PRIVATE_KEY_PEM, PUBLIC_KEY_PEM};
    use crate::protocol::handshake::tests::handshake_payload;
    use crate::protocol::Encrypted;
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::{Oaep, RsaPrivateKey};
    use sha1::Sha1;
    use tokio::io::DuplexStream;
    use tokio_test::io::Builder;

    const OK: [u8; 7] = [0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];

    fn seed() -> [u8; 20] {
        let mut seed = [0u8; 20];
        for (i, byte) in seed.iter_mut().enumerate() {
            *byte = i as u8 + 1;
        }
        seed
    }

    fn credentials(password: Option<&str>) -> Credentials {
        Credentials {
            user: "app".to_string(),
            password: password.map(str::to_string),
            database: None,
        }
    }

    fn pair() -> (PacketStream<DuplexStream>, PacketStream<DuplexStream>) {
        let (client, server) = tokio::io::duplex(1 << 16);
        (PacketStream::new(client), PacketStream::new(server))
    }

    /// Server side: send the handshake and return the auth data of the response
    async fn server_handshake(server: &mut PacketStream<DuplexStream>, plugin: &str) -> Vec<u8> {
        server.send(&handshake_payload("8.0.36", plugin, &seed())).await.unwrap();
        let mut reader = WireReader::new(server.get_packet().await.unwrap());
        reader.skip(32).unwrap();
        reader.read_null_terminated_bytes();
        reader.read_lenenc_bytes().unwrap().unwrap_or_default().to_vec()
    }

    async fn client_handshake(
        mut client: PacketStream<DuplexStream>,
        password: Option<&'static str>,
        options: AuthOptions,
    ) -> DriverResult<OkPacket> {
        let handshake = InitialHandshake::parse(client.get_packet().await?)?;
        authenticate(&mut client, &handshake, &credentials(password), &options).await
    }

    #[tokio::test]
    async fn test_empty_password_sends_zero_length_packet() {
        let mock = Builder::new()
            .write(&[0, 0, 0, 3])
            .read(&[7, 0, 0, 4])
            .read(&OK)
            .build();
        let mut stream = PacketStream::new(mock);
        stream.start_packet(3);
        let packet = process(
            &mut stream,
            AuthPlugin::NativePassword,
            None,
            &seed(),
            &AuthOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(&packet[..], &OK[..]);
    }

    #[tokio::test]
    async fn test_clear_text_fails_closed_on_plain_transport() {
        let mock = Builder::new().build();
        let mut stream = PacketStream::new(mock);
        let err = process(
            &mut stream,
            AuthPlugin::ClearText,
            Some("secret"),
            &seed(),
            &AuthOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Auth(AuthError::CleartextOverInsecureChannel)
        ));
    }

    #[tokio::test]
    async fn test_clear_text_over_encrypted_transport() {
        let mock = Builder::new()
            .write(&[7, 0, 0, 1])
            .write(b"secret\0")
            .read(&[7, 0, 0, 2])
            .read(&OK)
            .build();
        let mut stream = PacketStream::new(Encrypted(mock));
        stream.start_packet(1);
        let packet = process(
            &mut stream,
            AuthPlugin::ClearText,
            Some("secret"),
            &seed(),
            &AuthOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(packet[0], header::OK);
    }

    #[tokio::test]
    async fn test_native_password_handshake() {
        let (client, mut server) = pair();
        let server = tokio::spawn(async move {
            let auth = server_handshake(&mut server, "mysql_native_password").await;
            assert_eq!(auth, scramble::native_password(b"secret", &seed()).unwrap());
            server.send(&OK).await.unwrap();
        });

        let ok = client_handshake(client, Some("secret"), AuthOptions::default())
            .await
            .unwrap();
        assert_eq!(ok.status_flags, 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_caching_sha2_fast_path() {
        let (client, mut server) = pair();
        let server = tokio::spawn(async move {
            let auth = server_handshake(&mut server, "caching_sha2_password").await;
            assert_eq!(auth, scramble::caching_sha2(b"secret", &seed()).unwrap());
            server.send(&[0x01, FAST_AUTH_SUCCESS]).await.unwrap();
            server.send(&OK).await.unwrap();
        });

        client_handshake(client, Some("secret"), AuthOptions::default())
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_caching_sha2_full_auth_with_configured_key() {
        let (client, mut server) = pair();
        let server = tokio::spawn(async move {
            server_handshake(&mut server, "caching_sha2_password").await;
            server
                .send(&[0x01, PERFORM_FULL_AUTHENTICATION])
                .await
                .unwrap();
            let encrypted = server.get_packet().await.unwrap();
            let private = RsaPrivateKey::from_pkcs8_pem(PRIVATE_KEY_PEM).unwrap();
            let plain = private.decrypt(Oaep::new::<Sha1>(), &encrypted).unwrap();
            assert_eq!(plain, scramble::xor_with_seed(b"secret", &seed()));
            server.send(&OK).await.unwrap();
        });

        let options = AuthOptions {
            server_rsa_public_key: Some(PUBLIC_KEY_PEM.to_string()),
            allow_public_key_retrieval: false,
        };
        client_handshake(client, Some("secret"), options).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_caching_sha2_public_key_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), PUBLIC_KEY_PEM).unwrap();
        let path = file.path().to_string_lossy().into_owned();
        assert_eq!(load_public_key(&path).await.unwrap(), PUBLIC_KEY_PEM);
    }

    #[tokio::test]
    async fn test_caching_sha2_retrieves_server_key() {
        let (client, mut server) = pair();
        let server = tokio::spawn(async move {
            server_handshake(&mut server, "caching_sha2_password").await;
            server
                .send(&[0x01, PERFORM_FULL_AUTHENTICATION])
                .await
                .unwrap();
            let request = server.get_packet().await.unwrap();
            assert_eq!(&request[..], &[REQUEST_PUBLIC_KEY]);

            let mut key = vec![0x01];
            key.extend_from_slice(PUBLIC_KEY_PEM.as_bytes());
            server.send(&key).await.unwrap();

            let encrypted = server.get_packet().await.unwrap();
            assert_eq!(encrypted.len(), 128);
            server.send(&OK).await.unwrap();
        });

        let options = AuthOptions {
            server_rsa_public_key: None,
            allow_public_key_retrieval: true,
        };
        client_handshake(client, Some("secret"), options).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_caching_sha2_full_auth_without_key_fails() {
        let (client, mut server) = pair();
        let server = tokio::spawn(async move {
            server_handshake(&mut server, "caching_sha2_password").await;
            server
                .send(&[0x01, PERFORM_FULL_AUTHENTICATION])
                .await
                .unwrap();
        });

        let err = client_handshake(client, Some("secret"), AuthOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Auth(AuthError::PublicKeyRetrievalNotAllowed)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_caching_sha2_unexpected_status_byte() {
        let (client, mut server) = pair();
        let server = tokio::spawn(async move {
            server_handshake(&mut server, "caching_sha2_password").await;
            server.send(&[0x01, 0x09]).await.unwrap();
        });

        let err = client_handshake(client, Some("secret"), AuthOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Auth(AuthError::UnexpectedResponse(0x09))
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_switch_to_ed25519() {
        let (client, mut server) = pair();
        let switch_seed = [9u8; 32];
        let server = tokio::spawn(async move {
            server_handshake(&mut server, "mysql_native_password").await;
            let mut switch = vec![0xFE];
            switch.extend_from_slice(b"client_ed25519\0");
            switch.extend_from_slice(&switch_seed);
            switch.push(0);
            server.send(&switch).await.unwrap();

            let signature = server.get_packet().await.unwrap();
            assert_eq!(&signature[..], &ed25519::sign(&switch_seed, b"secret")[..]);
            server.send(&OK).await.unwrap();
        });

        client_handshake(client, Some("secret"), AuthOptions::default())
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_switch_with_empty_password_sends_empty_packet() {
        let (client, mut server) = pair();
        let server = tokio::spawn(async move {
            let auth = server_handshake(&mut server, "mysql_native_password").await;
            assert!(auth.is_empty());
            let mut switch = vec![0xFE];
            switch.extend_from_slice(b"mysql_native_password\0");
            switch.extend_from_slice(&[5u8; 20]);
            server.send(&switch).await.unwrap();

            let response = server.get_packet().await.unwrap();
            assert!(response.is_empty());
            server.send(&OK).await.unwrap();
        });

        client_handshake(client, None, AuthOptions::default())
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_switch_to_unknown_plugin() {
        let (client, mut server) = pair();
        let server = tokio::spawn(async move {
            server_handshake(&mut server, "mysql_native_password").await;
            server.send(b"\xFEdialog\0").await.unwrap();
        });

        let err = client_handshake(client, Some("secret"), AuthOptions::default())
            .await
            .unwrap_err();
        match err {
            DriverError::Auth(AuthError::UnsupportedPlugin(name)) => assert_eq!(name, "dialog"),
            other => panic!("unexpected error: {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_access_denied() {
        let (client, mut server) = pair();
        let server = tokio::spawn(async move {
            server_handshake(&mut server, "mysql_native_password").await;
            let mut err = vec![0xFF, 0x15, 0x04, b'#'];
            err.extend_from_slice(b"28000Access denied");
            server.send(&err).await.unwrap();
        });

        let err = client_handshake(client, Some("wrong"), AuthOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Server { code: 1045, .. }));
        server.await.unwrap();
    }
}

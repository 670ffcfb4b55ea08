/// MySQL/MariaDB client/server wire protocol
pub mod buffer;
pub mod handshake;
pub mod message;
pub mod packet;

pub use buffer::{WireReader, WireWriter};
pub use packet::{Encrypted, PacketStream, Transport, MAX_PACKET_SIZE};

/// Command bytes sent as the first payload byte of a command packet
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_INIT_DB: u8 = 0x02;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_PING: u8 = 0x0E;
}

/// Capability flags exchanged during the handshake
pub mod capabilities {
    pub const CLIENT_MYSQL: u64 = 1;
    pub const FOUND_ROWS: u64 = 2;
    pub const LONG_FLAG: u64 = 4;
    pub const CONNECT_WITH_DB: u64 = 8;
    pub const COMPRESS: u64 = 32;
    pub const LOCAL_FILES: u64 = 128;
    pub const IGNORE_SPACE: u64 = 256;
    pub const CLIENT_PROTOCOL_41: u64 = 512;
    pub const CLIENT_INTERACTIVE: u64 = 1024;
    pub const SSL: u64 = 2048;
    pub const TRANSACTIONS: u64 = 8192;
    pub const SECURE_CONNECTION: u64 = 32768;
    pub const MULTI_STATEMENTS: u64 = 1 << 16;
    pub const MULTI_RESULTS: u64 = 1 << 17;
    pub const PS_MULTI_RESULTS: u64 = 1 << 18;
    pub const PLUGIN_AUTH: u64 = 1 << 19;
    pub const CONNECT_ATTRS: u64 = 1 << 20;
    pub const PLUGIN_AUTH_LENENC_CLIENT_DATA: u64 = 1 << 21;
    pub const CLIENT_SESSION_TRACK: u64 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u64 = 1 << 24;
    /// MariaDB extension: server is not MySQL (bit 0 cleared in the base flags)
    pub const MARIADB_CLIENT_EXTENDED_TYPE_INFO: u64 = 1 << 35;

    /// Flags this driver always asks for
    pub const DEFAULT: u64 = CLIENT_MYSQL
        | FOUND_ROWS
        | LONG_FLAG
        | IGNORE_SPACE
        | CLIENT_PROTOCOL_41
        | TRANSACTIONS
        | SECURE_CONNECTION
        | MULTI_RESULTS
        | PS_MULTI_RESULTS
        | PLUGIN_AUTH
        | PLUGIN_AUTH_LENENC_CLIENT_DATA;
}

/// Server status flags carried by OK and EOF packets
pub mod status {
    pub const IN_TRANSACTION: u16 = 1;
    pub const AUTOCOMMIT: u16 = 2;
    pub const MORE_RESULTS_EXISTS: u16 = 8;
}

/// First payload byte of generic server responses
pub mod header {
    pub const OK: u8 = 0x00;
    pub const AUTH_MORE_DATA: u8 = 0x01;
    pub const LOCAL_INFILE: u8 = 0xFB;
    pub const EOF: u8 = 0xFE;
    pub const ERR: u8 = 0xFF;
}

/// utf8mb4_general_ci
pub const DEFAULT_COLLATION: u8 = 45;

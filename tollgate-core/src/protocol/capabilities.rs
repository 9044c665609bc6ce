use bitflags::bitflags;

bitflags! {
    /// Client/server capability flags exchanged during the handshake.
    ///
    /// The proxy itself always negotiates `PROTOCOL_41 | SECURE_CONNECTION
    /// | LONG_PASSWORD`; everything else is whatever the upstream backend
    /// advertised, minus the bits the proxy cannot relay.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// Use the improved version of the Old Password Authentication.
        const LONG_PASSWORD = 1;

        /// Send found rows instead of affected rows.
        const FOUND_ROWS = 2;

        /// Get all column flags.
        const LONG_FLAG = 4;

        /// Database name can be specified on connect.
        const CONNECT_WITH_DB = 8;

        const NO_SCHEMA = 16;

        /// Compression protocol supported. The proxy never relays
        /// compressed frames and clears this bit.
        const COMPRESS = 32;

        const ODBC = 64;

        /// Can use LOAD DATA LOCAL INFILE.
        const LOCAL_FILES = 128;

        const IGNORE_SPACE = 256;

        /// 4.1 protocol: longer flags, warnings, sqlstate in ERR.
        const PROTOCOL_41 = 512;

        const INTERACTIVE = 1024;

        /// Switch to SSL after the handshake. Cleared by the proxy.
        const SSL = 2048;

        const IGNORE_SIGPIPE = 4096;

        const TRANSACTIONS = 8192;

        const RESERVED = 16384;

        /// 4.1 authentication with the 20-byte scramble.
        const SECURE_CONNECTION = 32768;

        const MULTI_STATEMENTS = 1 << 16;

        const MULTI_RESULTS = 1 << 17;

        const PS_MULTI_RESULTS = 1 << 18;

        /// The auth-plugin name is appended to the handshake packets.
        const PLUGIN_AUTH = 1 << 19;
    }
}

impl Capabilities {
    /// The bits the proxy itself insists on, independent of the backend.
    pub fn base() -> Capabilities {
        Capabilities::PROTOCOL_41 | Capabilities::SECURE_CONNECTION | Capabilities::LONG_PASSWORD
    }

    /// The bits the proxy cannot relay and strips from a server
    /// handshake before forwarding it.
    pub fn unsupported() -> Capabilities {
        Capabilities::COMPRESS | Capabilities::SSL
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::base()
    }
}

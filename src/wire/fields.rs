//! CBOR field-id tables for telemetry payloads
//!
//! Field ids are assigned here and nowhere else. Struct definitions in
//! `domain::stats` carry no wire knowledge, so renaming a Rust field can
//! never renumber the wire. Append new ids; never reuse one.

/// `CombinedData` map keys
pub mod combined {
    /// Drained stats snapshot
    pub const STATS: u64 = 0;
    /// Host info
    pub const INFO: u64 = 1;
}

/// `Stats` map keys
pub mod stats {
    /// Ping entry list
    pub const PING: u64 = 0;
    /// DNS entry list
    pub const DNS: u64 = 1;
    /// HTTP entry list
    pub const HTTP: u64 = 2;
    /// Speedtest entry list
    pub const SPEEDTEST: u64 = 3;
}

/// Ping entry map keys
pub mod ping {
    /// Target host
    pub const HOST: u64 = 0;
    /// Packet loss percentage
    pub const PACKET_LOSS: u64 = 1;
    /// Minimum RTT, ms
    pub const MIN_RTT: u64 = 2;
    /// Mean RTT, ms
    pub const AVG_RTT: u64 = 3;
    /// Maximum RTT, ms
    pub const MAX_RTT: u64 = 4;
    /// Completion time, epoch milliseconds
    pub const LAST_CHECKED: u64 = 5;
}

/// DNS entry map keys
pub mod dns {
    /// Resolved name
    pub const DOMAIN: u64 = 0;
    /// Resolver address
    pub const SERVER: u64 = 1;
    /// RR type
    pub const RECORD_TYPE: u64 = 2;
    /// Outcome code
    pub const STATUS: u64 = 3;
    /// Lookup time, ms
    pub const LOOKUP_TIME: u64 = 4;
    /// Error detail
    pub const ERROR_CODE: u64 = 5;
    /// Completion time, epoch milliseconds
    pub const LAST_CHECKED: u64 = 6;
}

/// HTTP entry map keys
pub mod http {
    /// Requested URL
    pub const URL: u64 = 0;
    /// Outcome code
    pub const STATUS: u64 = 1;
    /// Response time, ms
    pub const RESPONSE_TIME: u64 = 2;
    /// HTTP status code
    pub const STATUS_CODE: u64 = 3;
    /// Error detail
    pub const ERROR_CODE: u64 = 4;
    /// Completion time, epoch milliseconds
    pub const LAST_CHECKED: u64 = 5;
}

/// Speedtest entry map keys
pub mod speedtest {
    /// Pinned server id
    pub const SERVER_ID: u64 = 0;
    /// Outcome code
    pub const STATUS: u64 = 1;
    /// Download bandwidth, Mbps
    pub const DOWNLOAD_SPEED: u64 = 2;
    /// Upload bandwidth, Mbps
    pub const UPLOAD_SPEED: u64 = 3;
    /// Idle latency, ms
    pub const LATENCY: u64 = 4;
    /// Idle jitter, ms
    pub const JITTER: u64 = 5;
    /// Download phase bytes
    pub const DOWNLOAD_BYTES: u64 = 6;
    /// Upload phase bytes
    pub const UPLOAD_BYTES: u64 = 7;
    /// Error detail
    pub const ERROR_CODE: u64 = 8;
    /// Completion time, epoch milliseconds
    pub const LAST_CHECKED: u64 = 9;
}

/// `SystemInfo` map keys
pub mod info {
    /// Host name
    pub const HOSTNAME: u64 = 0;
    /// Agent semver
    pub const VERSION: u64 = 1;
    /// Public IP
    pub const PUBLIC_IP: u64 = 2;
    /// ISP name
    pub const ISP: u64 = 3;
    /// ASN
    pub const ASN: u64 = 4;
    /// NIC speed, Mbps
    pub const NIC_SPEED: u64 = 5;
    /// Rolling mean ping RTT, ms
    pub const ROLLING_PING: u64 = 6;
    /// Rolling mean DNS lookup, ms
    pub const ROLLING_DNS: u64 = 7;
}

/// `ProbeStatus` wire codes
pub mod status {
    /// Measurement completed
    pub const SUCCESS: u64 = 0;
    /// Target answered badly
    pub const ERROR: u64 = 1;
    /// Deadline expired
    pub const TIMEOUT: u64 = 2;
}

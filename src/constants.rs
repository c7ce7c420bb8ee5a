pub const ID_LEN: usize = 20;
pub const ID_BIT_COUNT: usize = ID_LEN * 8;

pub const COMPACT_SOCKADDR_V4_LEN: usize = 6;
pub const COMPACT_SOCKADDR_V6_LEN: usize = 18;
pub const COMPACT_NODE_V4_LEN: usize = ID_LEN + COMPACT_SOCKADDR_V4_LEN;
pub const COMPACT_NODE_V6_LEN: usize = ID_LEN + COMPACT_SOCKADDR_V6_LEN;

/// BEP-5 bucket size.
pub const K_NODE_PER_BUCKET: usize = 8;

/// Nodes responsible for a key: the K closest.
pub const RESPONSIBLE_NODES_PER_KEY: usize = K_NODE_PER_BUCKET;

/// BEP-44 value size limit (bencoded form).
pub const MAX_VALUE_LEN: usize = 1000;
/// BEP-44 salt size limit.
pub const MAX_SALT_LEN: usize = 64;

pub const WRITE_QUERY_RETRIES: usize = 3;

/// Peers returned per `get_peers` reply; fits a UDP datagram comfortably.
pub const MAX_PEERS_PER_REPLY: usize = 50;

/// Signed data block size declared in `X-Ouinet-BSigs`.
pub const DATA_BLOCK_SIZE: usize = 65536;
/// Largest block size a receiver accepts.
pub const MAX_DATA_BLOCK_SIZE: usize = 16 * 1024 * 1024;

/// Cache protocol version carried in `X-Ouinet-Version`.
pub const PROTOCOL_VERSION: u32 = 5;

/// Peers asked concurrently for one block by the multi-peer reader.
pub const BLOCK_FANOUT: usize = 3;

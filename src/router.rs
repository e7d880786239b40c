//! Some known public DHT routers, usable as bootstrap contacts after
//! resolving them (they are plain hostnames, not node ids).

pub const BITTORRENT_DHT: &str = "router.bittorrent.com:6881";
pub const TRANSMISSION_DHT: &str = "dht.transmissionbt.com:6881";
pub const UTORRENT_DHT: &str = "router.utorrent.com:6881";

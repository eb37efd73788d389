//! Port block layout and service roles shared by every nsgrid crate.

use serde::{Deserialize, Serialize};

/// Number of ports in one block.
pub const PORTS_PER_BLOCK: u16 = 5;

/// Positional role of a port inside a [`PortBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRole {
    SqlHttp,
    SqlRaft,
    CacheHttp,
    CacheMemberlist,
    Gateway,
}

impl PortRole {
    pub const ALL: [PortRole; 5] = [
        PortRole::SqlHttp,
        PortRole::SqlRaft,
        PortRole::CacheHttp,
        PortRole::CacheMemberlist,
        PortRole::Gateway,
    ];

    /// Offset of this role from the block base.
    pub fn offset(self) -> u16 {
        match self {
            PortRole::SqlHttp => 0,
            PortRole::SqlRaft => 1,
            PortRole::CacheHttp => 2,
            PortRole::CacheMemberlist => 3,
            PortRole::Gateway => 4,
        }
    }
}

/// A contiguous group of five ports owned by one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortBlock {
    /// Slot index in the allocator's table.
    pub slot: u32,
    /// First port of the block (`range_start + 5 * slot`).
    pub base: u16,
}

impl PortBlock {
    pub fn new(slot: u32, base: u16) -> Self {
        Self { slot, base }
    }

    pub fn port(&self, role: PortRole) -> u16 {
        self.base + role.offset()
    }

    pub fn sql_http(&self) -> u16 {
        self.port(PortRole::SqlHttp)
    }

    pub fn sql_raft(&self) -> u16 {
        self.port(PortRole::SqlRaft)
    }

    pub fn cache_http(&self) -> u16 {
        self.port(PortRole::CacheHttp)
    }

    pub fn cache_memberlist(&self) -> u16 {
        self.port(PortRole::CacheMemberlist)
    }

    pub fn gateway(&self) -> u16 {
        self.port(PortRole::Gateway)
    }

    /// Last port of the block (inclusive).
    pub fn last(&self) -> u16 {
        self.base + PORTS_PER_BLOCK - 1
    }

    pub fn overlaps(&self, other: &PortBlock) -> bool {
        self.base <= other.last() && other.base <= self.last()
    }
}

/// One of the three child services that make up a namespace cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Sql,
    Cache,
    Gateway,
}

impl ServiceRole {
    /// Launch order: the gateway depends on the other two.
    pub const ALL: [ServiceRole; 3] = [ServiceRole::Sql, ServiceRole::Cache, ServiceRole::Gateway];

    /// The port the service serves HTTP on.
    pub fn http_port(self, block: &PortBlock) -> u16 {
        match self {
            ServiceRole::Sql => block.sql_http(),
            ServiceRole::Cache => block.cache_http(),
            ServiceRole::Gateway => block.gateway(),
        }
    }

    /// Passive listen port owned by the service, if any.
    pub fn peer_port(self, block: &PortBlock) -> Option<u16> {
        match self {
            ServiceRole::Sql => Some(block.sql_raft()),
            ServiceRole::Cache => Some(block.cache_memberlist()),
            ServiceRole::Gateway => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceRole::Sql => "sql",
            ServiceRole::Cache => "cache",
            ServiceRole::Gateway => "gateway",
        }
    }
}

impl std::fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ports_follow_fixed_offsets() {
        let block = PortBlock::new(3, 10015);
        assert_eq!(block.sql_http(), 10015);
        assert_eq!(block.sql_raft(), 10016);
        assert_eq!(block.cache_http(), 10017);
        assert_eq!(block.cache_memberlist(), 10018);
        assert_eq!(block.gateway(), 10019);
        assert_eq!(block.last(), 10019);
    }

    #[test]
    fn adjacent_blocks_do_not_overlap() {
        let a = PortBlock::new(0, 10000);
        let b = PortBlock::new(1, 10005);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&PortBlock::new(9, 10004)));
    }

    #[test]
    fn service_roles_map_to_block_ports() {
        let block = PortBlock::new(0, 20000);
        assert_eq!(ServiceRole::Sql.http_port(&block), 20000);
        assert_eq!(ServiceRole::Sql.peer_port(&block), Some(20001));
        assert_eq!(ServiceRole::Cache.http_port(&block), 20002);
        assert_eq!(ServiceRole::Cache.peer_port(&block), Some(20003));
        assert_eq!(ServiceRole::Gateway.http_port(&block), 20004);
        assert_eq!(ServiceRole::Gateway.peer_port(&block), None);
    }
}

/// Static command classification
///
/// Every known command name maps to one flag; anything unlisted is a keyed
/// write routed to the primary of its key's slot.
use fnv::FnvHashMap;
use lazy_static::lazy_static;

use crate::resp::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdFlag {
    /// May be served by a replica
    Read,
    /// Must fan out across every primary in the cluster
    ReadAll,
    /// Handled locally by the proxy, never forwarded
    Proxy,
    /// Explicitly refused: incompatible with cluster proxying
    Unknown,
    /// Keyed command routed to the primary of its key's slot
    General,
}

use CmdFlag::*;

lazy_static! {
    static ref CMD_TABLE: FnvHashMap<&'static str, CmdFlag> = {
        let entries: &[(&str, CmdFlag)] = &[
            ("HELLO", Unknown),
            ("ASKING", Unknown),
            ("AUTH", Proxy),
            ("BGREWRITEAOF", Unknown),
            ("BGSAVE", Unknown),
            ("BITCOUNT", Read),
            ("BITOP", Unknown),
            ("BITPOS", Read),
            ("BLPOP", Unknown),
            ("BRPOP", Unknown),
            ("BRPOPLPUSH", Unknown),
            ("CLIENT", Unknown),
            ("CLUSTER", Unknown),
            ("COMMAND", Read),
            ("CONFIG", Unknown),
            ("DBSIZE", Unknown),
            ("DEBUG", Unknown),
            ("DISCARD", Unknown),
            ("DUMP", Read),
            ("ECHO", Unknown),
            ("EXEC", ReadAll),
            ("EXISTS", Read),
            ("FLUSHALL", Unknown),
            ("FLUSHDB", Unknown),
            ("GET", Read),
            ("GETBIT", Read),
            ("GETRANGE", Read),
            ("HEXISTS", Read),
            ("HGET", Read),
            ("HGETALL", Read),
            ("HKEYS", Read),
            ("HLEN", Read),
            ("HMGET", Read),
            ("HSCAN", Read),
            ("HVALS", Read),
            ("INFO", Read),
            ("KEYS", ReadAll),
            ("LASTSAVE", Unknown),
            ("LATENCY", Read),
            ("LINDEX", Read),
            ("LLEN", Read),
            ("LRANGE", Read),
            ("MGET", Read),
            ("MIGRATE", Unknown),
            ("MONITOR", Unknown),
            ("MOVE", Unknown),
            ("MSETNX", Unknown),
            ("MULTI", ReadAll),
            ("OBJECT", Unknown),
            ("PFCOUNT", Read),
            ("PFSELFTEST", Read),
            ("PING", Proxy),
            ("PSUBSCRIBE", Unknown),
            ("PSYNC", Read),
            ("PTTL", Read),
            ("PUBLISH", Unknown),
            ("PUBSUB", Read),
            ("PUNSUBSCRIBE", Unknown),
            ("RANDOMKEY", Unknown),
            ("READONLY", Read),
            ("READWRITE", Read),
            ("RENAME", Unknown),
            ("RENAMENX", Unknown),
            ("REPLCONF", Read),
            ("SAVE", Unknown),
            ("SCAN", ReadAll),
            ("SCARD", Read),
            ("SCRIPT", Unknown),
            ("SDIFF", Read),
            ("SELECT", Proxy),
            ("SHUTDOWN", Unknown),
            ("SINTER", Read),
            ("SISMEMBER", Read),
            ("SLAVEOF", Unknown),
            ("SLOWLOG", ReadAll),
            ("SMEMBERS", Read),
            ("SRANDMEMBER", Read),
            ("SSCAN", Read),
            ("STRLEN", Read),
            ("SUBSCRIBE", Unknown),
            ("SUBSTR", Read),
            ("SUNION", Read),
            ("SYNC", Unknown),
            ("TIME", Unknown),
            ("TTL", Read),
            ("TYPE", Read),
            ("UNSUBSCRIBE", Unknown),
            ("UNWATCH", Unknown),
            ("WAIT", Read),
            ("WATCH", Unknown),
            ("ZCARD", Read),
            ("ZCOUNT", Read),
            ("ZLEXCOUNT", Read),
            ("ZRANGE", Read),
            ("ZRANGEBYLEX", Read),
            ("ZRANGEBYSCORE", Read),
            ("ZRANK", Read),
            ("ZREVRANGE", Read),
            ("ZREVRANGEBYLEX", Read),
            ("ZREVRANGEBYSCORE", Read),
            ("ZREVRANK", Read),
            ("ZSCAN", Read),
            ("ZSCORE", Read),
        ];
        entries.iter().copied().collect()
    };
}

pub fn cmd_flag(cmd: &Command) -> CmdFlag {
    CMD_TABLE.get(cmd.name()).copied().unwrap_or(General)
}

pub fn cmd_unknown(cmd: &Command) -> bool {
    cmd_flag(cmd) == Unknown
}

pub fn cmd_read_all(cmd: &Command) -> bool {
    cmd_flag(cmd) == ReadAll
}

/// Whether the command may be served by a replica
pub fn cmd_read_only(cmd: &Command) -> bool {
    matches!(cmd_flag(cmd), Read | ReadAll)
}

/// Whether the command requires a prior successful AUTH
pub fn cmd_auth_required(cmd: &Command) -> bool {
    !matches!(cmd.name(), "AUTH" | "HELLO")
}

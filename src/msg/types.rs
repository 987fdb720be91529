//! Entity identity types: who a peer is and where it lives.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::MessengerError;

/// Kind of entity on the other end of a connection.
///
/// Policies are keyed by this value. The discriminants are the on-wire
/// representation.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Mon = 1,
    Mds = 2,
    Osd = 4,
    Client = 8,
    Mgr = 16,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Mon,
        EntityType::Mds,
        EntityType::Osd,
        EntityType::Client,
        EntityType::Mgr,
    ];

    /// Decode the wire byte. Unknown values yield `None`.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(EntityType::Mon),
            2 => Some(EntityType::Mds),
            4 => Some(EntityType::Osd),
            8 => Some(EntityType::Client),
            16 => Some(EntityType::Mgr),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Mon => "mon",
            EntityType::Mds => "mds",
            EntityType::Osd => "osd",
            EntityType::Client => "client",
            EntityType::Mgr => "mgr",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = MessengerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MessengerError::InvalidName(s.to_string()))
    }
}

/// Logical name of an entity, e.g. `osd.3`. Carried as the message source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityName {
    pub ty: EntityType,
    pub num: i64,
}

impl EntityName {
    /// Ordinal used by entities that have not been assigned one yet.
    pub const NEW: i64 = -1;

    pub fn new(ty: EntityType, num: i64) -> Self {
        Self { ty, num }
    }

    pub fn client(num: i64) -> Self {
        Self::new(EntityType::Client, num)
    }

    pub fn osd(num: i64) -> Self {
        Self::new(EntityType::Osd, num)
    }

    pub fn mon(num: i64) -> Self {
        Self::new(EntityType::Mon, num)
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.num == Self::NEW {
            write!(f, "{}.?", self.ty)
        } else {
            write!(f, "{}.{}", self.ty, self.num)
        }
    }
}

impl FromStr for EntityName {
    type Err = MessengerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, num) = s
            .split_once('.')
            .ok_or_else(|| MessengerError::InvalidName(s.to_string()))?;
        let ty: EntityType = ty.parse()?;
        let num = if num == "?" {
            Self::NEW
        } else {
            num.parse::<i64>()
                .map_err(|_| MessengerError::InvalidName(s.to_string()))?
        };
        Ok(Self { ty, num })
    }
}

impl Serialize for EntityName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Network identity of an entity: socket address plus a per-process nonce.
///
/// Two processes that reuse the same ip:port are told apart by the nonce.
/// Ordering is total (type, then nonce, then socket address) and is used to
/// break connection races.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityAddr {
    pub ty: u32,
    pub nonce: u32,
    pub addr: SocketAddr,
}

impl EntityAddr {
    pub const TYPE_LEGACY: u32 = 1;

    pub fn new(addr: SocketAddr, nonce: u32) -> Self {
        Self {
            ty: Self::TYPE_LEGACY,
            nonce,
            addr,
        }
    }

    /// An address with an unspecified IP and port 0.
    pub fn blank(nonce: u32) -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), nonce)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn is_blank_ip(&self) -> bool {
        self.addr.ip().is_unspecified()
    }

    /// Replace the IP, keeping port, nonce and type.
    pub fn set_ip(&mut self, ip: IpAddr) {
        self.addr.set_ip(ip);
    }

    /// True when both addresses share port and nonce and either IP is blank
    /// or the IPs match. Used to recognise ourselves behind a wildcard bind.
    pub fn probably_equals(&self, other: &EntityAddr) -> bool {
        if self.port() != other.port() || self.nonce != other.nonce {
            return false;
        }
        if self.is_blank_ip() || other.is_blank_ip() {
            return true;
        }
        self.ip() == other.ip()
    }
}

impl fmt::Display for EntityAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.nonce)
    }
}

impl FromStr for EntityAddr {
    type Err = MessengerError;

    /// Parses `ip:port/nonce`; the nonce is optional and defaults to 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sock, nonce) = match s.rsplit_once('/') {
            Some((sock, nonce)) => {
                let nonce = nonce
                    .parse::<u32>()
                    .map_err(|_| MessengerError::InvalidAddress(s.to_string()))?;
                (sock, nonce)
            }
            None => (s, 0),
        };
        let addr: SocketAddr = sock
            .parse()
            .map_err(|_| MessengerError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(addr, nonce))
    }
}

impl Serialize for EntityAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Name and address together: everything needed to reach an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EntityInst {
    pub name: EntityName,
    pub addr: EntityAddr,
}

impl EntityInst {
    pub fn new(name: EntityName, addr: EntityAddr) -> Self {
        Self { name, addr }
    }
}

impl fmt::Display for EntityInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_name_parse_and_display() {
        let name: EntityName = "osd.3".parse().unwrap();
        assert_eq!(name, EntityName::osd(3));
        assert_eq!(name.to_string(), "osd.3");

        let anon: EntityName = "client.?".parse().unwrap();
        assert_eq!(anon.num, EntityName::NEW);
        assert_eq!(anon.to_string(), "client.?");

        assert!("bogus.1".parse::<EntityName>().is_err());
        assert!("osd".parse::<EntityName>().is_err());
    }

    #[test]
    fn entity_type_wire_values() {
        for ty in EntityType::ALL {
            assert_eq!(EntityType::from_u8(ty.as_u8()), Some(ty));
        }
        assert_eq!(EntityType::from_u8(3), None);
    }

    #[test]
    fn entity_addr_parse() {
        let a: EntityAddr = "127.0.0.1:6800/42".parse().unwrap();
        assert_eq!(a.port(), 6800);
        assert_eq!(a.nonce, 42);
        assert_eq!(a.to_string(), "127.0.0.1:6800/42");

        let v6: EntityAddr = "[::1]:6801".parse().unwrap();
        assert_eq!(v6.nonce, 0);
        assert!(v6.ip().is_loopback());
    }

    #[test]
    fn probably_equals_with_blank_ip() {
        let bound: EntityAddr = "0.0.0.0:6800/7".parse().unwrap();
        let seen: EntityAddr = "10.0.0.5:6800/7".parse().unwrap();
        let other_nonce: EntityAddr = "10.0.0.5:6800/8".parse().unwrap();
        let other_ip: EntityAddr = "10.0.0.6:6800/7".parse().unwrap();

        assert!(bound.probably_equals(&seen));
        assert!(seen.probably_equals(&bound));
        assert!(!seen.probably_equals(&other_nonce));
        assert!(!seen.probably_equals(&other_ip));
    }

    #[test]
    fn addr_ordering_is_total() {
        let a: EntityAddr = "127.0.0.1:6800/1".parse().unwrap();
        let b: EntityAddr = "127.0.0.1:6801/1".parse().unwrap();
        let c: EntityAddr = "127.0.0.1:6800/2".parse().unwrap();
        assert!(a < b);
        assert!(b < c, "nonce orders before socket address");
    }
}

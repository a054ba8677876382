use std::fmt;
use std::str::FromStr;

use wirerpc_common::WireRpcError;

use crate::balance::Weighted;

/// Weight given to a provider that does not announce one.
pub const DEFAULT_WEIGHT: i32 = 100;

/// A remote endpoint offering services, with its selection weight.
///
/// Weights are expected in `[0, 100]`; a weight of zero or less keeps the
/// provider out of every balancer snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Provider {
    pub addr: String,
    pub weight: i32,
}

impl Provider {
    pub fn new(addr: impl Into<String>, weight: i32) -> Self {
        Self {
            addr: addr.into(),
            weight,
        }
    }
}

impl Weighted for Provider {
    fn weight(&self) -> i32 {
        self.weight
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.weight)
    }
}

/// Parses `host:port` or `host:port:weight`. Bracketed IPv6 hosts are
/// accepted (`[::1]:7000:50`).
impl FromStr for Provider {
    type Err = WireRpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WireRpcError::Config(format!("invalid provider '{}'", s));

        let (head, tail) = s.rsplit_once(':').ok_or_else(invalid)?;
        let has_weight = head.rfind(':') > head.rfind(']');

        let provider = if has_weight {
            let weight = tail.parse::<i32>().map_err(|_| invalid())?;
            Provider::new(head, weight)
        } else {
            Provider::new(s, DEFAULT_WEIGHT)
        };

        let port = provider.addr.rsplit_once(':').map(|(_, port)| port);
        if port.map_or(true, |p| p.parse::<u16>().is_err()) {
            return Err(invalid());
        }
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_without_weight() {
        let provider: Provider = "127.0.0.1:7000".parse().unwrap();
        assert_eq!(provider, Provider::new("127.0.0.1:7000", DEFAULT_WEIGHT));
    }

    #[test]
    fn test_parse_with_weight() {
        let provider: Provider = "10.0.0.5:7000:25".parse().unwrap();
        assert_eq!(provider, Provider::new("10.0.0.5:7000", 25));
    }

    #[test]
    fn test_parse_ipv6() {
        let provider: Provider = "[::1]:7000".parse().unwrap();
        assert_eq!(provider.addr, "[::1]:7000");
        assert_eq!(provider.weight, DEFAULT_WEIGHT);

        let provider: Provider = "[::1]:7000:5".parse().unwrap();
        assert_eq!(provider.addr, "[::1]:7000");
        assert_eq!(provider.weight, 5);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("localhost".parse::<Provider>().is_err());
        assert!("localhost:port".parse::<Provider>().is_err());
        assert!("localhost:7000:heavy".parse::<Provider>().is_err());
    }
}

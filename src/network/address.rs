// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use tokio::net::lookup_host;

use crate::AppError::AddressFormat;
use crate::AppResult;

/// A parsed `host:port` string.
///
/// An empty host or `*` stands for the wildcard address. IPv6 hosts must be
/// bracketed (`[::1]:80`). Host names are kept as is and resolved on
/// [`Endpoint::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: Option<String>,
    port: u16,
}

impl Endpoint {
    pub fn parse(addr: &str) -> AppResult<Endpoint> {
        let (host, port) = addr
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| AddressFormat(addr.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressFormat(addr.to_string()))?;

        let host = match host {
            "" | "*" => None,
            bracketed if bracketed.starts_with('[') && bracketed.ends_with(']') => {
                let inner = &bracketed[1..bracketed.len() - 1];
                if inner.parse::<IpAddr>().is_err() {
                    return Err(AddressFormat(addr.to_string()));
                }
                Some(inner.to_string())
            }
            // unbracketed ipv6 is ambiguous with the port separator
            ambiguous if ambiguous.contains(':') => return Err(AddressFormat(addr.to_string())),
            host => Some(host.to_string()),
        };
        Ok(Endpoint { host, port })
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_wildcard(&self) -> bool {
        self.host.is_none()
    }

    /// Turns the endpoint into a socket address, resolving host names.
    pub async fn resolve(&self) -> AppResult<SocketAddr> {
        let host = match &self.host {
            None => return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)),
            Some(host) => host,
        };
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        lookup_host((host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| AddressFormat(format!("{} resolves to no address", self)))
    }
}

impl FromStr for Endpoint {
    type Err = crate::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            None => write!(f, "*:{}", self.port),
            Some(host) if host.contains(':') => write!(f, "[{}]:{}", host, self.port),
            Some(host) => write!(f, "{}:{}", host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppError;
    use rstest::rstest;

    #[rstest]
    #[case("127.0.0.1:80", Some("127.0.0.1"), 80)]
    #[case(":8080", None, 8080)]
    #[case("*:9000", None, 9000)]
    #[case("localhost:1", Some("localhost"), 1)]
    #[case("[::1]:443", Some("::1"), 443)]
    fn test_parse_valid(#[case] input: &str, #[case] host: Option<&str>, #[case] port: u16) {
        let endpoint = Endpoint::parse(input).unwrap();
        assert_eq!(endpoint.host(), host);
        assert_eq!(endpoint.port(), port);
        assert_eq!(endpoint.is_wildcard(), host.is_none());
    }

    #[rstest]
    #[case("127.0.0.1")]
    #[case("")]
    #[case("host:")]
    #[case("host:http")]
    #[case("host:70000")]
    #[case("::1:80")]
    #[case("[not-an-ip]:80")]
    fn test_parse_rejects(#[case] input: &str) {
        assert!(matches!(
            Endpoint::parse(input),
            Err(AppError::AddressFormat(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(Endpoint::parse(":80").unwrap().to_string(), "*:80");
        assert_eq!(Endpoint::parse("[::1]:80").unwrap().to_string(), "[::1]:80");
        assert_eq!(
            "10.0.0.1:5".parse::<Endpoint>().unwrap().to_string(),
            "10.0.0.1:5"
        );
    }

    #[tokio::test]
    async fn test_resolve() -> AppResult<()> {
        let wildcard = Endpoint::parse("*:9000")?.resolve().await?;
        assert!(wildcard.ip().is_unspecified());
        assert_eq!(wildcard.port(), 9000);

        let loopback = Endpoint::parse("127.0.0.1:9001")?.resolve().await?;
        assert_eq!(loopback, "127.0.0.1:9001".parse::<SocketAddr>().unwrap());
        Ok(())
    }
}

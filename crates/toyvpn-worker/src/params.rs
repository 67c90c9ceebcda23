//! Interface parameters sent by the server
//!
//! The server answers the secret with a control packet whose text is a
//! space-separated list of `key,value[,value]` fields:
//!
//! - `m,<mtu>`
//! - `a,<address>,<prefix>`
//! - `r,<address>,<prefix>`
//! - `d,<dns server>`
//! - `s,<search domain>`

use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("Parameters are not valid UTF-8")]
    NotUtf8,

    #[error("Bad parameter '{0}'")]
    BadField(String),

    #[error("Server sent no interface address")]
    NoAddress,
}

/// Address or route with its prefix length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub address: IpAddr,
    pub prefix: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelParameters {
    pub mtu: Option<u16>,
    pub addresses: Vec<Route>,
    pub routes: Vec<Route>,
    pub dns_servers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
}

impl TunnelParameters {
    /// Parse the text part of the server's control reply
    pub fn parse(raw: &[u8]) -> Result<Self, ParamError> {
        let text = std::str::from_utf8(raw).map_err(|_| ParamError::NotUtf8)?;
        let mut params = TunnelParameters::default();

        for field in text.split_whitespace() {
            let bad = || ParamError::BadField(field.to_string());
            let mut parts = field.split(',');
            let key = parts.next().ok_or_else(bad)?;
            let values: Vec<&str> = parts.collect();

            match (key, values.as_slice()) {
                ("m", [mtu]) => params.mtu = Some(mtu.parse().map_err(|_| bad())?),
                ("a", [address, prefix]) => params.addresses.push(parse_route(address, prefix).ok_or_else(bad)?),
                ("r", [address, prefix]) => params.routes.push(parse_route(address, prefix).ok_or_else(bad)?),
                ("d", [server]) => params.dns_servers.push(server.parse().map_err(|_| bad())?),
                ("s", [domain]) if !domain.is_empty() => params.search_domains.push(domain.to_string()),
                _ => return Err(bad()),
            }
        }

        if params.addresses.is_empty() {
            return Err(ParamError::NoAddress);
        }
        Ok(params)
    }
}

fn parse_route(address: &str, prefix: &str) -> Option<Route> {
    let address: IpAddr = address.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    let max = if address.is_ipv4() { 32 } else { 128 };
    (prefix <= max).then_some(Route { address, prefix })
}

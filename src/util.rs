use std::net::{IpAddr, Ipv4Addr};

const PLATFORM_PORT: &str = "COLONY_PLATFORM_PORT";

pub const DEFAULT_PLATFORM_PORT: u16 = 5555;

pub fn get_platform_port() -> u16 {
    let port_from_env = std::env::var(PLATFORM_PORT);
    port_from_env.map_or(DEFAULT_PLATFORM_PORT, |res| {
        res.parse().unwrap_or(DEFAULT_PLATFORM_PORT)
    })
}

const PLATFORM_ADDR: &str = "COLONY_PLATFORM_ADDR";

const DEFAULT_PLATFORM_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub fn get_platform_addr() -> IpAddr {
    let addr_from_env = std::env::var(PLATFORM_ADDR);
    addr_from_env.map_or(DEFAULT_PLATFORM_ADDR, |res| {
        res.parse().unwrap_or(DEFAULT_PLATFORM_ADDR)
    })
}

const TOKEN: &str = "COLONY_TOKEN";

pub fn get_token() -> Option<String> {
    std::env::var(TOKEN).ok().filter(|token| !token.is_empty())
}

/// Name of this machine, `"localhost"` when the OS does not report one
pub fn hostname() -> String {
    sysinfo::System::host_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Host part of an `http://host:port/...` URL
pub fn url_host(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?']).next()?;
    let host = match authority.strip_prefix('[') {
        Some(v6) => v6.split(']').next()?,
        None => authority.rsplit_once(':').map_or(authority, |(host, _)| host),
    };
    (!host.is_empty()).then_some(host)
}

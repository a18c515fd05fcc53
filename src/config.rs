use std::{fmt, net::Ipv4Addr, str::FromStr, time::Duration};

use percent_encoding::percent_decode_str;
use url::Url;

use crate::{socks5_client::Timeouts, Error};

pub const DEFAULT_PROXY_PORT: u16 = 1080;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_UDP_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_TCP_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 10_000;

/// How UDP flows reach the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdpTransport {
    /// SOCKS5 UDP ASSOCIATE only.
    Associate,
    /// UDP-over-TCP (command `0xF3`) only.
    Tunnel,
    /// Try UDP ASSOCIATE, fall back to the tunnel if the proxy answers "command not supported".
    #[default]
    Auto,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where the SOCKS5 proxy lives and how to talk to it.
///
/// Parses from either a bare `host:port` or a `socks5://[user:pass@]host[:port]` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// `host:port` handed to the TCP dialer.
    pub address: String,
    pub credentials: Option<Credentials>,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub udp_transport: UdpTransport,
}

impl ProxyConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            credentials: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            udp_transport: UdpTransport::default(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_udp_transport(mut self, transport: UdpTransport) -> Self {
        self.udp_transport = transport;
        self
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            read: self.read_timeout,
            write: self.write_timeout,
        }
    }

    fn from_url(input: &str) -> Result<Self, Error> {
        let url = Url::parse(input)
            .map_err(|err| Error::InvalidConfig(format!("invalid proxy url {input:?}: {err}")))?;

        match url.scheme() {
            "socks5" | "socks5h" => {}
            scheme => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported proxy scheme {scheme:?}"
                )))
            }
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::InvalidConfig(format!("proxy url {input:?} has no host")))?;
        let port = url.port().unwrap_or(DEFAULT_PROXY_PORT);

        let mut config = Self::new(format!("{host}:{port}"));
        if !url.username().is_empty() {
            let username = decode_userinfo(url.username())?;
            let password = decode_userinfo(url.password().unwrap_or_default())?;
            config = config.with_credentials(username, password);
        }
        Ok(config)
    }
}

/// `Url` keeps userinfo percent-encoded.
fn decode_userinfo(part: &str) -> Result<String, Error> {
    percent_decode_str(part)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|err| Error::InvalidConfig(format!("proxy credentials are not UTF-8: {err}")))
}

impl FromStr for ProxyConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains("://") {
            return Self::from_url(s);
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::new(s))
            }
            _ => Err(Error::InvalidConfig(format!(
                "proxy address {s:?} is not host:port"
            ))),
        }
    }
}

/// Everything the [`Engine`](crate::Engine) needs besides the interface itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub proxy: ProxyConfig,
    /// Resolvers whose traffic is served from the DNS cache. Empty means any port-53 destination.
    pub dns_servers: Vec<Ipv4Addr>,
    /// Drop packets addressed to non-global or private destinations.
    pub public_only: bool,
    pub dns_cache: bool,
    pub mtu: usize,
    pub udp_ttl: Duration,
    pub tcp_idle_timeout: Duration,
    pub tcp_close_timeout: Duration,
    pub reassembly_timeout: Duration,
    pub write_queue_capacity: usize,
}

impl EngineConfig {
    pub fn new(proxy: ProxyConfig) -> Self {
        Self {
            proxy,
            dns_servers: Vec::new(),
            public_only: false,
            dns_cache: false,
            mtu: DEFAULT_MTU,
            udp_ttl: DEFAULT_UDP_TTL,
            tcp_idle_timeout: DEFAULT_TCP_IDLE_TIMEOUT,
            tcp_close_timeout: DEFAULT_TCP_CLOSE_TIMEOUT,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
        }
    }

    pub fn with_dns_servers(mut self, servers: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        self.dns_servers = servers.into_iter().collect();
        self
    }

    pub fn with_public_only(mut self, public_only: bool) -> Self {
        self.public_only = public_only;
        self
    }

    pub fn with_dns_cache(mut self, enabled: bool) -> Self {
        self.dns_cache = enabled;
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_udp_ttl(mut self, ttl: Duration) -> Self {
        self.udp_ttl = ttl;
        self
    }

    pub fn with_tcp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_idle_timeout = timeout;
        self
    }

    pub fn with_tcp_close_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_close_timeout = timeout;
        self
    }

    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    pub fn with_write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    /// Whether a port-53 datagram to `server` goes through the DNS cache.
    pub fn intercepts_dns(&self, server: Ipv4Addr) -> bool {
        self.dns_cache && (self.dns_servers.is_empty() || self.dns_servers.contains(&server))
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        // IPv4 header plus a minimal fragment
        if self.mtu < 68 || self.mtu > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "mtu {} outside 68..=65535",
                self.mtu
            )));
        }
        if self.write_queue_capacity == 0 {
            return Err(Error::InvalidConfig("write queue capacity is zero".into()));
        }
        Ok(())
    }
}

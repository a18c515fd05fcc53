//! Opens proxied upstream connections.
//!
//! Every upstream gets its own TCP connection to the proxy: dial, method negotiation, then
//! one request. TCP flows use `CONNECT`; UDP flows use `UDP ASSOCIATE` or the UDP-over-TCP
//! extension, depending on [`UdpTransport`].

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use tokio::{
    net::{TcpStream, UdpSocket},
    time::timeout,
};
use tracing::{debug, trace};

use crate::{
    auth::{Authenticator, NoAuthAuthenticator, UsernamePasswordAuthenticator},
    config::{ProxyConfig, UdpTransport},
    protocol::{Command, Reply, SocksSocketAddr},
    socks5_client::{Socks5Client, UdpUpstream},
    Socks5Error,
};

#[derive(Debug, Clone)]
pub struct Connector {
    config: Arc<ProxyConfig>,
}

impl Connector {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// A byte stream to `destination`, relayed by the proxy.
    pub async fn connect(&self, destination: SocketAddr) -> Result<TcpStream, Socks5Error> {
        let stream = self.dial().await?;
        let (stream, _) = self
            .negotiate(stream, Command::Connect, &destination.into())
            .await?;
        trace!(%destination, "Proxy connected");
        Ok(stream)
    }

    /// A datagram path to `destination`, relayed by the proxy.
    pub async fn open_udp(&self, destination: SocketAddr) -> Result<UdpUpstream, Socks5Error> {
        match self.config.udp_transport {
            UdpTransport::Associate => self.associate(destination).await,
            UdpTransport::Tunnel => self.tunnel(destination).await,
            UdpTransport::Auto => match self.associate(destination).await {
                Err(Socks5Error::Socks5Error(Reply::CommandNotSupported)) => {
                    debug!(%destination, "UDP ASSOCIATE unsupported, using UDP-over-TCP");
                    self.tunnel(destination).await
                }
                other => other,
            },
        }
    }

    async fn associate(&self, destination: SocketAddr) -> Result<UdpUpstream, Socks5Error> {
        let stream = self.dial().await?;
        let (control, bound) = self
            .negotiate(stream, Command::UdpAssociate, &SocksSocketAddr::unspecified())
            .await?;

        let relay = if bound.addr.is_unspecified() {
            SocketAddr::new(control.peer_addr()?.ip(), bound.port)
        } else {
            bound.to_socket_addr().await?.into_iter().next().ok_or_else(|| {
                Socks5Error::Protocol(format!("Relay address {bound} did not resolve"))
            })?
        };

        let local = if relay.is_ipv4() {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(relay).await?;
        trace!(%destination, %relay, "UDP association ready");

        Ok(UdpUpstream::Associate {
            control,
            socket,
            destination,
        })
    }

    async fn tunnel(&self, destination: SocketAddr) -> Result<UdpUpstream, Socks5Error> {
        let stream = self.dial().await?;
        let (stream, _) = self
            .negotiate(stream, Command::UdpTunnel, &destination.into())
            .await?;
        trace!(%destination, "UDP tunnel ready");

        Ok(UdpUpstream::Tunnel {
            stream,
            destination,
        })
    }

    async fn dial(&self) -> Result<TcpStream, Socks5Error> {
        let address = self.config.address.as_str();
        let stream = match timeout(self.config.dial_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(proxy = address, %err, "Failed to reach proxy");
                return Err(Socks5Error::Dial(err));
            }
            Err(_) => return Err(Socks5Error::Timeout),
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn negotiate(
        &self,
        stream: TcpStream,
        command: Command,
        destination: &SocksSocketAddr,
    ) -> Result<(TcpStream, SocksSocketAddr), Socks5Error> {
        match &self.config.credentials {
            Some(credentials) => {
                let authenticator = UsernamePasswordAuthenticator::new(
                    credentials.username.clone(),
                    credentials.password.clone(),
                );
                self.negotiate_with(stream, authenticator, command, destination)
                    .await
            }
            None => {
                self.negotiate_with(stream, NoAuthAuthenticator, command, destination)
                    .await
            }
        }
    }

    async fn negotiate_with<A>(
        &self,
        stream: TcpStream,
        authenticator: A,
        command: Command,
        destination: &SocksSocketAddr,
    ) -> Result<(TcpStream, SocksSocketAddr), Socks5Error>
    where
        A: Authenticator<TcpStream> + Send,
    {
        let mut client = Socks5Client::new(stream, authenticator, self.config.timeouts());
        client.handshake().await?;
        let bound = client.request(command, destination).await?;
        Ok((client.into_inner(), bound))
    }
}

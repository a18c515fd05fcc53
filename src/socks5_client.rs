use std::{future::Future, io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::{debug, trace};

use crate::{
    auth::Authenticator,
    protocol::{AuthMethod, Command, Reply, SocksSocketAddr, RESERVED, VERSION},
    Socks5Error,
};

pub mod associate;

pub use associate::{UdpReceiver, UdpSender, UdpUpstream};

/// Deadlines applied to every individual read and write of the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub read: Duration,
    pub write: Duration,
}

/// The client end of a SOCKS5 control connection.
pub struct Socks5Client<T, A> {
    inner: T,
    authenticator: A,
    timeouts: Timeouts,
}

impl<T, A> Socks5Client<T, A>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    A: Authenticator<T> + Send,
{
    pub fn new(inner: T, authenticator: A, timeouts: Timeouts) -> Self {
        Self {
            inner,
            authenticator,
            timeouts,
        }
    }

    /// Greeting, method selection and the selected method's sub-negotiation.
    pub async fn handshake(&mut self) -> Result<AuthMethod, Socks5Error> {
        let offered = self.authenticator.methods().to_vec();

        let mut greeting = Vec::with_capacity(2 + offered.len());
        greeting.push(VERSION);
        greeting.push(offered.len() as u8);
        greeting.extend(offered.iter().map(|method| method.to_u8()));
        self.write_all(&greeting).await?;

        let mut selection = [0; 2];
        self.read_exact(&mut selection).await?;
        if selection[0] != VERSION {
            return Err(Socks5Error::Protocol(format!(
                "Invalid SOCKS version {:#04x} in method selection",
                selection[0]
            )));
        }

        let method = AuthMethod::from_u8(selection[1]);
        trace!(?method, "Proxy selected authentication method");
        if method == AuthMethod::NoAcceptableMethods {
            return Err(Socks5Error::NoAcceptableMethod);
        }
        if !offered.contains(&method) {
            return Err(Socks5Error::Protocol(format!(
                "Proxy selected {method:?}, which was not offered"
            )));
        }

        let budget = self.timeouts.read + self.timeouts.write;
        match timeout(budget, self.authenticator.authenticate(&mut self.inner, method)).await {
            Ok(result) => result?,
            Err(_) => return Err(Socks5Error::Timeout),
        }

        Ok(method)
    }

    /// Sends `command` for `destination` and returns the proxy's bound address.
    pub async fn request(
        &mut self,
        command: Command,
        destination: &SocksSocketAddr,
    ) -> Result<SocksSocketAddr, Socks5Error> {
        let mut request = vec![VERSION, command.to_u8(), RESERVED];
        request.extend(destination.to_bytes()?);
        self.write_all(&request).await?;

        let mut header = [0; 3];
        self.read_exact(&mut header).await?;
        if header[0] != VERSION {
            return Err(Socks5Error::Protocol(format!(
                "Invalid SOCKS version {:#04x} in reply",
                header[0]
            )));
        }

        let reply = Reply::from_u8_lossy(header[1]);
        if reply != Reply::Success {
            debug!(?command, %destination, %reply, "Proxy refused request");
            return Err(reply.into());
        }

        let bound = deadline(self.timeouts.read, SocksSocketAddr::read(&mut self.inner)).await?;
        trace!(?command, %bound, "Proxy accepted request");
        Ok(bound)
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), Socks5Error> {
        deadline(self.timeouts.write, self.inner.write_all(bytes)).await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Socks5Error> {
        deadline(self.timeouts.read, self.inner.read_exact(buf))
            .await
            .map(|_| ())
    }
}

async fn deadline<F, O>(duration: Duration, operation: F) -> Result<O, Socks5Error>
where
    F: Future<Output = io::Result<O>>,
{
    match timeout(duration, operation).await {
        Ok(result) => result.map_err(Socks5Error::from),
        Err(_) => Err(Socks5Error::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use tokio::io::{duplex, DuplexStream};

    use super::*;
    use crate::{
        auth::{NoAuthAuthenticator, UsernamePasswordAuthenticator},
        protocol::Addr,
    };

    fn timeouts() -> Timeouts {
        Timeouts {
            read: Duration::from_secs(2),
            write: Duration::from_secs(2),
        }
    }

    async fn expect(proxy: &mut DuplexStream, expected: &[u8]) {
        let mut buf = vec![0; expected.len()];
        proxy.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn connect_with_credentials() {
        let (client, mut proxy) = duplex(256);
        let destination: SocketAddr = (Ipv4Addr::new(93, 184, 216, 34), 443).into();

        let proxy_side = tokio::spawn(async move {
            expect(&mut proxy, &[0x05, 0x02, 0x02, 0x00]).await;
            proxy.write_all(&[0x05, 0x02]).await.unwrap();
            expect(&mut proxy, &[0x01, 1, b'u', 1, b'p']).await;
            proxy.write_all(&[0x01, 0x00]).await.unwrap();
            expect(&mut proxy, &[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB]).await;
            proxy
                .write_all(&[0x05, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0x04, 0x38])
                .await
                .unwrap();
        });

        let mut client = Socks5Client::new(
            client,
            UsernamePasswordAuthenticator::new("u", "p"),
            timeouts(),
        );
        assert_eq!(
            client.handshake().await.unwrap(),
            AuthMethod::UsernamePassword
        );
        let bound = client
            .request(Command::Connect, &destination.into())
            .await
            .unwrap();
        assert_eq!(bound.addr, Addr::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(bound.port, 1080);
        proxy_side.await.unwrap();
    }

    #[tokio::test]
    async fn refused_request_surfaces_reply() {
        let (client, mut proxy) = duplex(256);

        tokio::spawn(async move {
            expect(&mut proxy, &[0x05, 0x01, 0x00]).await;
            proxy.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0; 10];
            proxy.read_exact(&mut request).await.unwrap();
            proxy
                .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let mut client = Socks5Client::new(client, NoAuthAuthenticator, timeouts());
        client.handshake().await.unwrap();
        let err = client
            .request(Command::Connect, &SocksSocketAddr::unspecified())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Socks5Error::Socks5Error(Reply::ConnectionRefused)
        ));
    }

    #[tokio::test]
    async fn no_acceptable_method() {
        let (client, mut proxy) = duplex(256);

        tokio::spawn(async move {
            expect(&mut proxy, &[0x05, 0x01, 0x00]).await;
            proxy.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let mut client = Socks5Client::new(client, NoAuthAuthenticator, timeouts());
        assert!(matches!(
            client.handshake().await,
            Err(Socks5Error::NoAcceptableMethod)
        ));
    }

    #[tokio::test]
    async fn silent_proxy_times_out() {
        let (client, _proxy) = duplex(256);
        let timeouts = Timeouts {
            read: Duration::from_millis(50),
            write: Duration::from_millis(50),
        };

        let mut client = Socks5Client::new(client, NoAuthAuthenticator, timeouts);
        assert!(matches!(
            client.handshake().await,
            Err(Socks5Error::Timeout)
        ));
    }
}

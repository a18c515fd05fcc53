//! # Username/Password Authentication
//!
//! Client side of the RFC 1929 sub-negotiation. The proxy is offered both
//! `UsernamePassword` and `NoAuthRequired`; credentials are only sent when the proxy
//! selects `UsernamePassword`.
//!
//! ```text
//! client -> proxy: VER(0x01) ULEN UNAME PLEN PASSWD
//! proxy -> client: VER(0x01) STATUS      (0x00 = success)
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{protocol::AuthMethod, Socks5Error};

use super::Authenticator;

const USER_PASSWORD_VERSION: u8 = 0x01;
const AUTH_SUCCESS: u8 = 0x00;

const OFFERED: [AuthMethod; 2] = [AuthMethod::UsernamePassword, AuthMethod::NoAuthRequired];

#[derive(Clone)]
pub struct UsernamePasswordAuthenticator {
    username: String,
    password: String,
}

impl UsernamePasswordAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn request(&self) -> Result<Vec<u8>, Socks5Error> {
        let username_len = field_len(&self.username, "Username")?;
        let password_len = field_len(&self.password, "Password")?;

        let mut request = Vec::with_capacity(3 + self.username.len() + self.password.len());
        request.push(USER_PASSWORD_VERSION);
        request.push(username_len);
        request.extend_from_slice(self.username.as_bytes());
        request.push(password_len);
        request.extend_from_slice(self.password.as_bytes());
        Ok(request)
    }
}

fn field_len(value: &str, name: &str) -> Result<u8, Socks5Error> {
    match u8::try_from(value.len()) {
        Ok(0) => Err(Socks5Error::Protocol(format!("{name} cannot be empty"))),
        Ok(len) => Ok(len),
        Err(_) => Err(Socks5Error::Protocol(format!(
            "{name} longer than 255 bytes"
        ))),
    }
}

impl<T> Authenticator<T> for UsernamePasswordAuthenticator
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn methods(&self) -> &[AuthMethod] {
        &OFFERED
    }

    async fn authenticate(&mut self, conn: &mut T, selected: AuthMethod) -> Result<(), Socks5Error> {
        match selected {
            AuthMethod::NoAuthRequired => return Ok(()),
            AuthMethod::UsernamePassword => {}
            _ => return Err(Socks5Error::NoAcceptableMethod),
        }

        conn.write_all(&self.request()?).await?;

        let mut response = [0; 2];
        conn.read_exact(&mut response).await?;
        if response[0] != USER_PASSWORD_VERSION {
            return Err(Socks5Error::Protocol(format!(
                "Invalid UsernamePassword version {:#04x}",
                response[0]
            )));
        }
        if response[1] != AUTH_SUCCESS {
            debug!(status = response[1], "Proxy rejected credentials");
            return Err(Socks5Error::AuthRejected(response[1]));
        }

        Ok(())
    }
}

impl std::fmt::Debug for UsernamePasswordAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsernamePasswordAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn sends_rfc1929_request() {
        let (mut client, mut proxy) = duplex(64);
        let mut auth = UsernamePasswordAuthenticator::new("user", "pw");

        let proxy_side = tokio::spawn(async move {
            let mut request = [0; 9];
            proxy.read_exact(&mut request).await.unwrap();
            proxy.write_all(&[0x01, 0x00]).await.unwrap();
            request
        });

        auth.authenticate(&mut client, AuthMethod::UsernamePassword)
            .await
            .unwrap();
        assert_eq!(
            proxy_side.await.unwrap(),
            [0x01, 4, b'u', b's', b'e', b'r', 2, b'p', b'w']
        );
    }

    #[tokio::test]
    async fn rejected_status_is_an_auth_error() {
        let (mut client, mut proxy) = duplex(64);
        let mut auth = UsernamePasswordAuthenticator::new("user", "wrong");

        tokio::spawn(async move {
            let mut request = [0; 12];
            proxy.read_exact(&mut request).await.unwrap();
            proxy.write_all(&[0x01, 0x01]).await.unwrap();
        });

        let err = auth
            .authenticate(&mut client, AuthMethod::UsernamePassword)
            .await
            .unwrap_err();
        assert!(matches!(err, Socks5Error::AuthRejected(0x01)));
    }

    #[tokio::test]
    async fn no_auth_selection_skips_sub_negotiation() {
        let (mut client, _proxy) = duplex(64);
        let mut auth = UsernamePasswordAuthenticator::new("user", "pw");
        auth.authenticate(&mut client, AuthMethod::NoAuthRequired)
            .await
            .unwrap();
    }

    #[test]
    fn oversized_username_is_refused() {
        let auth = UsernamePasswordAuthenticator::new("u".repeat(256), "pw");
        assert!(matches!(auth.request(), Err(Socks5Error::Protocol(_))));
    }
}

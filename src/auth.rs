use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{protocol::AuthMethod, Socks5Error};

pub mod no_auth_authenticator;
pub mod username_password_authenticator;

pub use no_auth_authenticator::NoAuthAuthenticator;
pub use username_password_authenticator::UsernamePasswordAuthenticator;

/// Client half of SOCKS5 method negotiation.
pub trait Authenticator<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Methods offered in the greeting, most preferred first.
    fn methods(&self) -> &[AuthMethod];

    /// Authenticator Should:
    /// Use `conn` for communication,
    /// perform the sub-negotiation of the method the proxy `selected`,
    /// return an error if the proxy refuses or picked a method it can't speak.
    fn authenticate(
        &mut self,
        conn: &mut T,
        selected: AuthMethod,
    ) -> impl Future<Output = Result<(), Socks5Error>> + Send;
}

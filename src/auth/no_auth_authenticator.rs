use tokio::io::{AsyncRead, AsyncWrite};

use crate::{protocol::AuthMethod, Socks5Error};

use super::Authenticator;

/// Offers only the "no authentication" method, which has no sub-negotiation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthAuthenticator;

impl<T> Authenticator<T> for NoAuthAuthenticator
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn methods(&self) -> &[AuthMethod] {
        &[AuthMethod::NoAuthRequired]
    }

    async fn authenticate(&mut self, _: &mut T, selected: AuthMethod) -> Result<(), Socks5Error> {
        match selected {
            AuthMethod::NoAuthRequired => Ok(()),
            _ => Err(Socks5Error::NoAcceptableMethod),
        }
    }
}

//! An [`r2d2`] connection pool over whole [`Client`]s, the blocking analog
//! of the teacher's `deadpool::managed::Manager<Client<C, P>, Error>`: each
//! pooled "connection" is a fully-configured client with its own ring, and
//! checkout/recycle validate it with a `NOOP` fan-out.

use r2d2::ManageConnection;

use crate::client::{Client, ClientConfig};
use crate::error::Error;
use crate::key::KeyDigest;
use crate::value::{ValueCompressor, ValueSerializer};

/// Builds and validates pooled [`Client`]s from one shared [`ClientConfig`].
pub struct ClientManager<S: ValueSerializer, C: ValueCompressor, D: KeyDigest> {
    config: ClientConfig<S, C, D>,
}

impl<S: ValueSerializer, C: ValueCompressor, D: KeyDigest> ClientManager<S, C, D> {
    pub fn new(config: ClientConfig<S, C, D>) -> Self {
        Self { config }
    }
}

impl<S, C, D> ManageConnection for ClientManager<S, C, D>
where
    S: ValueSerializer + 'static,
    C: ValueCompressor + 'static,
    D: KeyDigest + 'static,
{
    type Connection = Client<S, C, D>;
    type Error = Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let client = Client::new(self.config.clone())?;
        client.keep_alive()?;
        Ok(client)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.keep_alive()
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// A pool of [`Client`]s sharing one [`ClientConfig`]; each checkout is a
/// fully independent client with its own ring and connections.
pub type Pool<S, C, D> = r2d2::Pool<ClientManager<S, C, D>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Md5Hasher;
    use crate::value::{BincodeSerializer, NoCompressor};

    #[test]
    fn manager_wraps_the_config_it_was_built_with() {
        let config: ClientConfig<BincodeSerializer, NoCompressor, Md5Hasher> =
            ClientConfig::new("127.0.0.1:1");
        let manager = ClientManager::new(config);
        // Connecting against a closed port fails fast rather than hanging;
        // this only exercises that `connect()` reaches the network layer.
        assert!(manager.connect().is_err());
    }
}

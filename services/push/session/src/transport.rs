//! TLS transport to the push gateway.
//!
//! This module turns a PKCS#12 credential bundle into a client-authenticated
//! rustls context and uses it to open keep-alive TCP sessions to the gateway.
//! The context is built once per bundle and shared by every reconnect.

use crate::error::GatewayError;
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Production gateway host
pub const PRODUCTION_HOST: &str = "gateway.push.apple.com";
/// Sandbox gateway host
pub const SANDBOX_HOST: &str = "gateway.sandbox.push.apple.com";
/// Gateway port shared by both environments
pub const DEFAULT_PORT: u16 = 2195;

/// Stream type produced by [`TlsSessionFactory`]
pub type GatewayStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Host and port of the push gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAddress {
    /// DNS name, also used for SNI and certificate verification
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl GatewayAddress {
    /// Create an address for an arbitrary gateway
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The production gateway
    pub fn production() -> Self {
        Self::new(PRODUCTION_HOST, DEFAULT_PORT)
    }

    /// The sandbox gateway
    pub fn sandbox() -> Self {
        Self::new(SANDBOX_HOST, DEFAULT_PORT)
    }
}

impl Default for GatewayAddress {
    fn default() -> Self {
        Self::production()
    }
}

impl fmt::Display for GatewayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Client certificate store (PKCS#12) and the passphrase that unlocks it
#[derive(Clone)]
pub struct CredentialBundle {
    store: Vec<u8>,
    passphrase: String,
}

impl CredentialBundle {
    /// Wrap raw PKCS#12 bytes
    pub fn new(store: impl Into<Vec<u8>>, passphrase: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            passphrase: passphrase.into(),
        }
    }

    /// Read the certificate store from any reader
    pub fn from_reader<R: Read>(mut reader: R, passphrase: impl Into<String>) -> Result<Self, GatewayError> {
        let mut store = Vec::new();
        reader
            .read_to_end(&mut store)
            .map_err(|e| GatewayError::Config(format!("failed to read certificate store: {}", e)))?;
        Ok(Self::new(store, passphrase))
    }

    /// Read the certificate store from a file
    pub fn from_file<P: AsRef<Path>>(path: P, passphrase: impl Into<String>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let store = std::fs::read(path).map_err(|e| {
            GatewayError::Config(format!("failed to read certificate store {:?}: {}", path, e))
        })?;
        Ok(Self::new(store, passphrase))
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("store_len", &self.store.len())
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// Opens sessions to the gateway.
///
/// The connection manager only depends on this trait, so tests can hand it
/// in-memory streams instead of real TLS sockets.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    /// Session stream type
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open and authenticate a new session
    async fn open_session(&self, address: &GatewayAddress) -> Result<Self::Stream, GatewayError>;
}

/// Session factory backed by a client-authenticated rustls context
#[derive(Clone)]
pub struct TlsSessionFactory {
    connector: TlsConnector,
    connect_timeout: Option<Duration>,
}

impl TlsSessionFactory {
    /// Build the TLS context from a credential bundle.
    ///
    /// Fails with [`GatewayError::Config`] before any network activity when the
    /// passphrase is empty or the store cannot be unlocked.
    pub fn new(credentials: &CredentialBundle) -> Result<Self, GatewayError> {
        let config = make_client_config(credentials)?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            connect_timeout: None,
        })
    }

    /// Bound the TCP connect and TLS handshake phase
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn dial(&self, address: &GatewayAddress) -> io::Result<GatewayStream> {
        let tcp_stream = connect_keepalive(address).await?;
        let server_name = ServerName::try_from(address.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        debug!("Starting TLS handshake with {}", address);
        self.connector.connect(server_name, tcp_stream).await
    }
}

#[async_trait]
impl SessionFactory for TlsSessionFactory {
    type Stream = GatewayStream;

    async fn open_session(&self, address: &GatewayAddress) -> Result<GatewayStream, GatewayError> {
        let result = match self.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.dial(address)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no session within {:?}", limit),
                )),
            },
            None => self.dial(address).await,
        };

        let stream = result.map_err(|e| GatewayError::handshake(address, e))?;
        info!("Authentication succeeded with {}", address);
        Ok(stream)
    }
}

/// Create a TLS client configuration carrying the bundle's client certificate
pub fn make_client_config(credentials: &CredentialBundle) -> Result<ClientConfig, GatewayError> {
    if credentials.passphrase.is_empty() {
        return Err(GatewayError::Config(
            "certificate store passphrase must not be empty".to_string(),
        ));
    }

    // Install default crypto provider if not already set
    let _ = rustls::crypto::ring::default_provider().install_default();

    let keystore = p12_keystore::KeyStore::from_pkcs12(&credentials.store, &credentials.passphrase)
        .map_err(|e| GatewayError::Config(format!("failed to open certificate store: {}", e)))?;

    let (alias, key_chain) = keystore
        .private_key_chain()
        .ok_or_else(|| GatewayError::Config("certificate store holds no private key".to_string()))?;

    let certs = key_chain
        .chain()
        .iter()
        .map(|cert| CertificateDer::from(cert.as_der().to_vec()))
        .collect::<Vec<_>>();
    if certs.is_empty() {
        return Err(GatewayError::Config(format!(
            "no certificate chain stored for key {:?}",
            alias
        )));
    }
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_chain.key().to_vec()));
    debug!("Loaded client key {:?} with {} certificate(s)", alias, certs.len());

    ClientConfig::builder()
        .with_root_certificates(platform_roots())
        .with_client_auth_cert(certs, key)
        .map_err(|e| GatewayError::Config(format!("failed to configure client certificate: {}", e)))
}

/// Platform trust roots, falling back to the bundled webpki set
fn platform_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        if let Err(e) = roots.add(cert) {
            warn!("Failed to add system certificate: {}", e);
        }
    }
    for err in &native.errors {
        warn!("Certificate load error: {}", err);
    }

    if roots.is_empty() || !native.errors.is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    debug!("Loaded {} trust roots", roots.len());
    roots
}

/// Resolve the gateway and connect the first reachable address with SO_KEEPALIVE set
async fn connect_keepalive(address: &GatewayAddress) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in tokio::net::lookup_host((address.host.as_str(), address.port)).await? {
        match connect_addr(addr).await {
            Ok(stream) => {
                debug!("TCP connection established to {} ({})", address, addr);
                return Ok(stream);
            }
            Err(e) => {
                debug!("Failed to connect to {} ({}): {}", address, addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} did not resolve to any address", address.host),
        )
    }))
}

async fn connect_addr(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    socket.connect(addr).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_address_is_production() {
        let address = GatewayAddress::default();
        assert_eq!(address.host, PRODUCTION_HOST);
        assert_eq!(address.port, DEFAULT_PORT);
        assert_eq!(address.to_string(), "gateway.push.apple.com:2195");
        assert_eq!(GatewayAddress::sandbox().host, SANDBOX_HOST);
    }

    #[test]
    fn test_empty_passphrase_is_config_error() {
        let bundle = CredentialBundle::new(vec![0x30, 0x82, 0x01, 0x00], "");
        match TlsSessionFactory::new(&bundle) {
            Err(GatewayError::Config(msg)) => assert!(msg.contains("passphrase")),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("empty passphrase must be rejected"),
        }
    }

    #[test]
    fn test_malformed_store_is_config_error() {
        let bundle = CredentialBundle::new(b"definitely not pkcs12".to_vec(), "secret");
        assert!(matches!(
            TlsSessionFactory::new(&bundle),
            Err(GatewayError::Config(_))
        ));
    }

    /// PKCS#12 store holding a self-signed client certificate and its key
    fn client_store(passphrase: &str, with_key: bool) -> Vec<u8> {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["push-client.example".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let cert = p12_keystore::Certificate::from_der(cert.der().as_ref()).unwrap();

        let mut keystore = p12_keystore::KeyStore::new();
        let entry = if with_key {
            let chain = p12_keystore::PrivateKeyChain::new(key_pair.serialize_der(), [1u8; 20], vec![cert]);
            p12_keystore::KeyStoreEntry::PrivateKeyChain(chain)
        } else {
            p12_keystore::KeyStoreEntry::Certificate(cert)
        };
        keystore.add_entry("push-client", entry);
        keystore.writer(passphrase).write().unwrap()
    }

    #[test]
    fn test_well_formed_store_builds_reusable_factory() {
        let bundle = CredentialBundle::new(client_store("secret", true), "secret");

        let factory = TlsSessionFactory::new(&bundle).unwrap();
        let factory = factory.with_connect_timeout(Some(Duration::from_secs(5)));
        assert_eq!(factory.connect_timeout, Some(Duration::from_secs(5)));
        assert!(make_client_config(&bundle).unwrap().client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_wrong_passphrase_is_config_error() {
        let bundle = CredentialBundle::new(client_store("secret", true), "not-the-secret");
        match TlsSessionFactory::new(&bundle) {
            Err(GatewayError::Config(msg)) => assert!(msg.contains("failed to open certificate store")),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("wrong passphrase must be rejected"),
        }
    }

    #[test]
    fn test_store_without_private_key_is_config_error() {
        let bundle = CredentialBundle::new(client_store("secret", false), "secret");
        match TlsSessionFactory::new(&bundle) {
            Err(GatewayError::Config(msg)) => assert!(msg.contains("no private key")),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("store without a key must be rejected"),
        }
    }

    #[test]
    fn test_missing_store_file_is_config_error() {
        let result = CredentialBundle::from_file("/nonexistent/push-cert.p12", "secret");
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_bundle_debug_redacts_passphrase() {
        let bundle = CredentialBundle::from_reader(&b"store"[..], "hunter2").unwrap();
        let rendered = format!("{:?}", bundle);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("store_len: 5"));
    }

    #[tokio::test]
    async fn test_connect_keepalive_refused() {
        // Bind then drop a listener to get a port nobody is accepting on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect_keepalive(&GatewayAddress::new("127.0.0.1", port)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_keepalive_accepts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = connect_keepalive(&GatewayAddress::new("127.0.0.1", port))
            .await
            .unwrap();
        assert!(stream.peer_addr().is_ok());
    }
}

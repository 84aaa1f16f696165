//! rustls configuration for both TLS edges: terminating the client with a
//! CA-minted leaf and dialing origin with real verification.

use std::sync::Arc;

use guard_ca::LeafEntry;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::ProxyError;

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP1: &[u8] = b"http/1.1";

static TLS_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Server config serving the minted leaf chained to the root. ALPN offers
/// h2 and http/1.1; minimum TLS 1.2.
pub(crate) fn server_config_for_leaf(
    leaf: &LeafEntry,
    http2_enabled: bool,
) -> Result<Arc<ServerConfig>, ProxyError> {
    let chain: Vec<CertificateDer<'static>> = leaf
        .chain_der
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect();
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(leaf.key_pkcs8_der.to_vec()));

    let mut config = ServerConfig::builder_with_protocol_versions(TLS_VERSIONS)
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|error| ProxyError::TlsConfig(error.to_string()))?;
    config.alpn_protocols = if http2_enabled {
        vec![ALPN_H2.to_vec(), ALPN_HTTP1.to_vec()]
    } else {
        vec![ALPN_HTTP1.to_vec()]
    };
    Ok(Arc::new(config))
}

/// Client config for the origin side. System (webpki) roots, optionally
/// narrowed or extended; certificate errors are fatal, never ignored.
pub(crate) fn origin_client_config(
    use_system_roots: bool,
    extra_roots_der: &[Vec<u8>],
    alpn: Option<Vec<u8>>,
) -> Result<Arc<ClientConfig>, ProxyError> {
    let mut root_store = if use_system_roots {
        RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
    } else {
        RootCertStore::empty()
    };
    for der in extra_roots_der {
        root_store
            .add(CertificateDer::from(der.clone()))
            .map_err(|error| ProxyError::TlsConfig(error.to_string()))?;
    }
    if root_store.is_empty() {
        return Err(ProxyError::TlsConfig(
            "origin trust store would be empty".to_string(),
        ));
    }

    let mut config = ClientConfig::builder_with_protocol_versions(TLS_VERSIONS)
        .with_root_certificates(root_store)
        .with_no_client_auth();
    if let Some(protocol) = alpn {
        config.alpn_protocols = vec![protocol];
    }
    Ok(Arc::new(config))
}

pub(crate) async fn accept_client_tls<S>(
    config: Arc<ServerConfig>,
    stream: S,
) -> std::io::Result<ServerTlsStream<S>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    TlsAcceptor::from(config).accept(stream).await
}

pub(crate) async fn connect_origin_tls(
    config: Arc<ClientConfig>,
    host: &str,
    stream: TcpStream,
) -> Result<ClientTlsStream<TcpStream>, ProxyError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::TlsConfig(format!("invalid origin server name {host:?}")))?;
    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|error| ProxyError::OriginTls {
            host: host.to_string(),
            detail: error.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use guard_ca::{CaConfig, CertificateAuthority, KeyStore, MemoryKeyStore};

    use super::{origin_client_config, server_config_for_leaf};

    fn mint_leaf() -> std::sync::Arc<guard_ca::LeafEntry> {
        let authority = CertificateAuthority::load_or_create(
            CaConfig::default(),
            Arc::new(MemoryKeyStore::default()) as Arc<dyn KeyStore>,
        )
        .expect("authority");
        authority.mint_leaf("example.com").expect("mint")
    }

    #[test]
    fn leaf_server_config_advertises_alpn() {
        let leaf = mint_leaf();
        let config = server_config_for_leaf(&leaf, true).expect("server config");
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );

        let http1_only = server_config_for_leaf(&leaf, false).expect("server config");
        assert_eq!(http1_only.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn origin_config_refuses_an_empty_trust_store() {
        assert!(origin_client_config(false, &[], None).is_err());
        assert!(origin_client_config(true, &[], None).is_ok());
    }

    #[test]
    fn extra_roots_extend_the_store() {
        let leaf = mint_leaf();
        let root_der = leaf.chain_der[1].clone();
        let config = origin_client_config(false, &[root_der], Some(b"http/1.1".to_vec()))
            .expect("config");
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}

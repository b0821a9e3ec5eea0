//! TLS connector with ALPN and per-origin handshake serialization.

use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::{Duration, SystemTime},
};

use log::trace;
use rustls::{
    client::{ClientSessionMemoryCache, Resumption, ServerCertVerified, ServerCertVerifier},
    Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{client::TlsStream, TlsConnector};
use tokio_util::sync::CancellationToken;

use crate::{
    alpn::{AlpnProtocol, Origin},
    error::TimedOut,
    Error,
};

/// Connector options derived from the client configuration.
pub(crate) struct ConnectorConfig {
    pub(crate) alpn_protocols: Vec<AlpnProtocol>,
    pub(crate) reject_unauthorized: bool,
    pub(crate) max_cached_sessions: usize,
    pub(crate) connect_timeout: Option<Duration>,
}

/// Opens TLS (and plain TCP) connections to origins.
///
/// Holds one rustls config per purpose: the negotiating config carries the
/// client's full ALPN preference list, while the pinned configs are used
/// when the protocol for a connection is already decided (fresh pooled
/// HTTP/1 connections, replacement HTTP/2 sessions).
pub(crate) struct Connector {
    negotiate: TlsConnector,
    h1_only: TlsConnector,
    h2_only: TlsConnector,
    locks: Mutex<HashMap<Origin, Arc<tokio::sync::Mutex<()>>>>,
    connect_timeout: Option<Duration>,
}

impl Connector {
    pub(crate) fn new(config: ConnectorConfig) -> crate::Result<Connector> {
        let base = base_tls_config(config.reject_unauthorized, config.max_cached_sessions)?;

        let with_alpn = |protocols: &[AlpnProtocol]| {
            let mut tls = base.clone();
            tls.alpn_protocols = protocols
                .iter()
                // h2c is implied by the URL scheme, never offered over TLS.
                .filter(|p| **p != AlpnProtocol::H2c)
                .map(|p| p.as_bytes().to_vec())
                .collect();
            TlsConnector::from(Arc::new(tls))
        };

        Ok(Connector {
            negotiate: with_alpn(&config.alpn_protocols),
            h1_only: with_alpn(&[AlpnProtocol::Http11]),
            h2_only: with_alpn(&[AlpnProtocol::H2]),
            locks: Mutex::new(HashMap::new()),
            connect_timeout: config.connect_timeout,
        })
    }

    /// The per-origin lock serializing TLS+ALPN handshakes. Without it, N
    /// parallel first-requests to an origin would each burn a handshake.
    pub(crate) fn origin_lock(&self, origin: &Origin) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("connect lock map poisoned");
        locks.entry(origin.clone()).or_default().clone()
    }

    /// Opens a TLS connection offering the client's full ALPN preference
    /// list and reports what the peer selected. No selection at all is
    /// treated as `http/1.1`.
    pub(crate) async fn connect_negotiate(
        &self,
        origin: &Origin,
        signal: &CancellationToken,
    ) -> crate::Result<(MaybeTls, AlpnProtocol)> {
        let stream = self.handshake(&self.negotiate, origin, signal).await?;
        let negotiated = stream
            .get_ref()
            .1
            .alpn_protocol()
            .and_then(AlpnProtocol::from_wire)
            .unwrap_or(AlpnProtocol::Http11);
        trace!("negotiated {negotiated} with {origin}");
        Ok((MaybeTls::Tls(Box::new(stream)), negotiated))
    }

    /// Opens a connection suitable for HTTP/1.x: plain TCP for cleartext
    /// origins, TLS with ALPN pinned to `http/1.1` otherwise.
    pub(crate) async fn connect_h1(
        &self,
        origin: &Origin,
        signal: &CancellationToken,
    ) -> crate::Result<MaybeTls> {
        if origin.is_https() {
            let stream = self.handshake(&self.h1_only, origin, signal).await?;
            Ok(MaybeTls::Tls(Box::new(stream)))
        } else {
            Ok(MaybeTls::Plain(self.guarded_tcp(origin, signal).await?))
        }
    }

    /// Opens a connection suitable for an HTTP/2 session: plain TCP for
    /// h2c origins, TLS with ALPN pinned to `h2` otherwise.
    pub(crate) async fn connect_h2(
        &self,
        origin: &Origin,
        signal: &CancellationToken,
    ) -> crate::Result<MaybeTls> {
        if origin.is_https() {
            let stream = self.handshake(&self.h2_only, origin, signal).await?;
            match stream.get_ref().1.alpn_protocol() {
                Some(b"h2") | None => Ok(MaybeTls::Tls(Box::new(stream))),
                Some(other) => Err(Error::protocol(format!(
                    "peer selected {:?} instead of h2",
                    String::from_utf8_lossy(other)
                ))),
            }
        } else {
            Ok(MaybeTls::Plain(self.guarded_tcp(origin, signal).await?))
        }
    }

    async fn handshake(
        &self,
        tls: &TlsConnector,
        origin: &Origin,
        signal: &CancellationToken,
    ) -> crate::Result<TlsStream<TcpStream>> {
        // url keeps ipv6 hosts bracketed; SNI wants the bare address.
        let host = origin.host().trim_start_matches('[').trim_end_matches(']');
        let server_name = ServerName::try_from(host).map_err(Error::tls)?;
        let connect = async {
            let tcp = tcp_connect(origin).await?;
            tls.connect(server_name, tcp).await.map_err(Error::tls)
        };
        self.guard(origin, signal, connect).await
    }

    async fn guarded_tcp(
        &self,
        origin: &Origin,
        signal: &CancellationToken,
    ) -> crate::Result<TcpStream> {
        self.guard(origin, signal, tcp_connect(origin)).await
    }

    /// Applies the connect timeout and the caller's abort signal to a
    /// pending connect.
    async fn guard<F, T>(
        &self,
        origin: &Origin,
        signal: &CancellationToken,
        fut: F,
    ) -> crate::Result<T>
    where
        F: std::future::Future<Output = crate::Result<T>>,
    {
        let timed = async {
            match self.connect_timeout {
                Some(timeout) => tokio::time::timeout(timeout, fut)
                    .await
                    .unwrap_or_else(|_| Err(Error::connect(TimedOut))),
                None => fut.await,
            }
        };
        tokio::select! {
            _ = signal.cancelled() => {
                trace!("connect to {origin} aborted by signal");
                Err(Error::abort())
            }
            res = timed => res,
        }
    }
}

async fn tcp_connect(origin: &Origin) -> crate::Result<TcpStream> {
    let stream = TcpStream::connect(origin.addr())
        .await
        .map_err(Error::connect)?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

fn base_tls_config(
    reject_unauthorized: bool,
    max_cached_sessions: usize,
) -> crate::Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();

    config.resumption = Resumption::store(Arc::new(ClientSessionMemoryCache::new(
        max_cached_sessions.max(1),
    )));

    if !reject_unauthorized {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier));
    }

    Ok(config)
}

/// Certificate verifier used when the caller opted out of verification.
struct NoCertVerifier;

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// A client connection that is either plain TCP or TLS.
#[derive(Debug)]
pub(crate) enum MaybeTls {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            MaybeTls::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            MaybeTls::Plain(s) => s.is_write_vectored(),
            MaybeTls::Tls(s) => s.is_write_vectored(),
        }
    }
}

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, SystemTime},
};

use quinn::{
    Connection, ConnectionError, RecvStream, SendStream, TransportConfig,
    VarInt,
};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate as RustlsCert, PrivateKey, ServerName,
};
use tokio::sync::mpsc;
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use super::{
    completion::{Ack, Outgoing},
    error::Error,
    listeners::{Inbound, Listeners},
    wire::{read_frame, write_frame, Method, Reply, Request},
    Transport, ALPN, SERVER_NAME,
};

/// Streams a single connection may have open at once.
const MAX_CONCURRENT_STREAMS: u32 = 1024;

/// QUIC transport. Every RPC rides its own bidirectional stream: one request
/// frame in, then one reply frame (or a run of items and a close) out.
pub struct QuicTransport {
    ep: quinn::Endpoint,
    listeners: Arc<Listeners>,
}

impl QuicTransport {
    /// Binds the endpoint and starts accepting connections. Must be called
    /// from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<Arc<Self>, Error> {
        let ep = quinn::Endpoint::server(server_config()?, addr)?;
        let listeners = Arc::new(Listeners::new());
        tokio::spawn(Self::start_acceptor(ep.clone(), listeners.clone()));
        info!(addr = %ep.local_addr()?, "quic transport listening");
        Ok(Arc::new(Self { ep, listeners }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.ep.local_addr()?)
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    /// Accepts incoming connections and spawns a task for each one.
    /// This runs until the endpoint is closed, so it should be spawned in a
    /// dedicated task.
    async fn start_acceptor(ep: quinn::Endpoint, listeners: Arc<Listeners>) {
        while let Some(connecting) = ep.accept().await {
            let listeners = listeners.clone();
            let remote = connecting.remote_address();
            let span = debug_span!("conn", %remote);
            tokio::spawn(
                async move {
                    match connecting.await {
                        Ok(conn) => {
                            Self::serve_connection(conn, listeners).await
                        }
                        Err(e) => debug!("handshake failed: {e}"),
                    }
                }
                .instrument(span),
            );
        }
        debug!("acceptor stopped");
    }

    async fn serve_connection(conn: Connection, listeners: Arc<Listeners>) {
        debug!("connection established");
        loop {
            match conn.accept_bi().await {
                Ok((send, recv)) => {
                    let listeners = listeners.clone();
                    tokio::spawn(
                        Self::serve_stream(send, recv, listeners)
                            .in_current_span(),
                    );
                }
                Err(
                    ConnectionError::ApplicationClosed(_)
                    | ConnectionError::LocallyClosed,
                ) => {
                    debug!("connection closed");
                    return;
                }
                Err(e) => {
                    debug!("connection lost: {e}");
                    return;
                }
            }
        }
    }

    /// Reads the request, hands it to the listeners and then writes whatever
    /// the Call sends back.
    async fn serve_stream(
        send: SendStream,
        mut recv: RecvStream,
        listeners: Arc<Listeners>,
    ) {
        let request = match read_frame::<Request>(&mut recv).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                trace!("stream finished before a request");
                return;
            }
            Err(e) => {
                debug!("unreadable request: {e}");
                return;
            }
        };
        let (replies, rx) = mpsc::unbounded_channel();
        if let Err(inbound) = listeners.dispatch(Inbound { request, replies }) {
            inbound.refuse();
        }
        write_replies(send, rx).await;
    }
}

/// Writes replies in order, one at a time, completing each ack once its frame
/// is written. Stops after the terminal reply or the first failed write; acks
/// still queued behind a failure are dropped and report it.
async fn write_replies(
    mut send: SendStream,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(Outgoing { reply, ack }) = rx.recv().await {
        let terminal = reply.is_terminal();
        match write_reply(&mut send, &reply, terminal).await {
            Ok(()) => ack.complete(true),
            Err(e) => {
                warn!("reply write failed: {e}");
                ack.complete(false);
                return;
            }
        }
        if terminal {
            return;
        }
    }
    // the Call went away without a terminal reply
    let _ = send.reset(VarInt::from_u32(1));
}

async fn write_reply(
    send: &mut SendStream,
    reply: &Reply,
    terminal: bool,
) -> Result<(), Error> {
    write_frame(send, reply).await?;
    if terminal {
        send.finish().await?;
    }
    Ok(())
}

impl Transport for QuicTransport {
    fn request_call(&self, method: Method, ack: Ack) {
        self.listeners.register(method, ack);
    }

    fn shutdown(&self) {
        self.listeners.shutdown();
        // no new connections; streams on live ones get refused
        self.ep.set_server_config(None);
    }

    fn close(&self) {
        self.ep.close(VarInt::from_u32(0), b"server stopped");
        info!("quic transport closed");
    }
}

fn transport_config() -> Arc<TransportConfig> {
    let mut config = TransportConfig::default();
    config.max_concurrent_bidi_streams(VarInt::from_u32(
        MAX_CONCURRENT_STREAMS,
    ));
    config.keep_alive_interval(Some(Duration::from_secs(5)));
    Arc::new(config)
}

/// Server TLS with a freshly generated self-signed certificate.
fn server_config() -> Result<quinn::ServerConfig, Error> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])
        .map_err(|e| Error::Certificate(e.to_string()))?;
    let cert_der = cert
        .serialize_der()
        .map_err(|e| Error::Certificate(e.to_string()))?;
    let key_der = cert.serialize_private_key_der();

    let mut tls = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![RustlsCert(cert_der)], PrivateKey(key_der))?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(tls));
    config.transport_config(transport_config());
    Ok(config)
}

/// Accepts whatever certificate the server presents. Authentication is left
/// to the deployment.
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &RustlsCert,
        _intermediates: &[RustlsCert],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn client_config() -> quinn::ClientConfig {
    let mut tls = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ClientConfig::new(Arc::new(tls));
    config.transport_config(transport_config());
    config
}

/// A client endpoint on an ephemeral port of the same address family as
/// `remote`.
pub fn client_endpoint(remote: SocketAddr) -> Result<quinn::Endpoint, Error> {
    let bind: SocketAddr = match remote {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let mut ep = quinn::Endpoint::client(bind)?;
    ep.set_default_client_config(client_config());
    Ok(ep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_to_an_ephemeral_port() {
        let transport =
            QuicTransport::bind(([127, 0, 0, 1], 0).into()).unwrap();
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        transport.shutdown();
        assert!(transport.listeners().is_shut_down());
        transport.close();
    }

    #[tokio::test]
    async fn client_endpoint_matches_address_family() {
        let v4 = client_endpoint(([127, 0, 0, 1], 9).into()).unwrap();
        assert!(v4.local_addr().unwrap().is_ipv4());
    }
}

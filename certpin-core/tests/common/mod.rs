#![allow(dead_code)]

use certpin_core::tls::{ServerIdentity, UpstreamTls};
use rustls::pki_types::{PrivatePkcs8KeyDer, ServerName};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::client::TlsStream;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Minted {
    pub der: Vec<u8>,
    pub pem: String,
    pub key_pem: String,
    pub identity: ServerIdentity,
}

pub fn mint(name: &str) -> Minted {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec![name.to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    let pkcs8 = PrivatePkcs8KeyDer::from(key.serialize_der());
    Minted {
        der: cert.der().to_vec(),
        pem: cert.pem(),
        key_pem: key.serialize_pem(),
        identity: ServerIdentity::new(vec![cert.der().clone()], pkcs8.into()).unwrap(),
    }
}

/// TLS echo server. Every finished connection reports the bytes it received.
pub struct EchoStub {
    pub addr: String,
    pub cert: Vec<u8>,
    pub sessions: mpsc::UnboundedReceiver<Vec<u8>>,
    /// TCP connections accepted so far, counted before any handshake.
    pub accepted: Arc<AtomicUsize>,
}

pub async fn echo_stub(name: &str) -> EchoStub {
    let Minted { der, identity, .. } = mint(name);
    let acceptor = TlsAcceptor::from(identity.server_config());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, sessions) = mpsc::unbounded_channel();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let acceptor = acceptor.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut received = Vec::new();
                if let Ok(mut tls) = acceptor.accept(tcp).await {
                    let mut buf = [0u8; 4096];
                    loop {
                        match tls.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                received.extend_from_slice(&buf[..n]);
                                if tls.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                let _ = tx.send(received);
            });
        }
    });

    EchoStub {
        addr,
        cert: der,
        sessions,
        accepted,
    }
}

pub async fn tls_client(addr: SocketAddr, sni: &str) -> io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr).await?;
    UpstreamTls::insecure()
        .unwrap()
        .connector()
        .connect(ServerName::try_from(sni.to_string()).unwrap(), tcp)
        .await
}

pub async fn echo_round_trip<S>(stream: &mut S, payload: &[u8])
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(payload).await.unwrap();
    let mut reply = vec![0u8; payload.len()];
    timeout(WAIT, stream.read_exact(&mut reply))
        .await
        .expect("echo reply timed out")
        .unwrap();
    assert_eq!(reply, payload);
}

/// Waits until the proxy has closed `stream`: EOF or a reset both count.
pub async fn assert_closed<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 64];
    let result = timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("connection should be closed by the proxy");
    assert!(matches!(result, Ok(0) | Err(_)), "unexpected data: {:?}", result);
}

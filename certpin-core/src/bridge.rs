//! Full-duplex byte bridge between two authenticated streams.
//!
//! Each direction reads up to `buffer_size` bytes and writes all of them
//! before reading again. The first direction to stop on EOF or an error
//! shuts its writer down and signals the other direction, which stops at
//! once and shuts down its own writer. The idle timeout is shared: data in
//! either direction keeps the whole session alive, and the session is torn
//! down the same way once neither direction has moved data for that long.
//! `bridge` owns both streams and drops each exactly once after both
//! directions have returned.

use crate::error::ProxyError;
use certpin_config::DEFAULT_BUFFER_SIZE;
use prometheus::IntCounter;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Bytes read per direction per cycle
    pub buffer_size: usize,
    /// Stop the session when neither direction has moved data for this long
    pub idle_timeout: Option<Duration>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

/// Bytes moved by a finished bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

#[derive(Debug)]
enum Outcome {
    Eof,
    PeerClosed,
    Failed(io::Error),
}

/// Copies bytes between `a` and `b` until either side ends, then closes both.
///
/// `counters` receive the bytes moved `a -> b` and `b -> a` respectively.
/// Returns [`ProxyError::Forward`] if a direction failed with anything other
/// than a clean end of stream; teardown has completed in that case too.
pub async fn bridge<A, B>(
    a: A,
    b: B,
    options: &BridgeOptions,
    counters: Option<(IntCounter, IntCounter)>,
) -> Result<BridgeStats, ProxyError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let (closed_tx, closed_rx) = watch::channel(false);
    let (activity_tx, activity_rx) = watch::channel(Instant::now());
    let (a_counter, b_counter) = match counters {
        Some((a_to_b, b_to_a)) => (Some(a_to_b), Some(b_to_a)),
        None => (None, None),
    };

    let a_to_b = forward(
        a_read,
        b_write,
        options,
        a_counter.as_ref(),
        &activity_tx,
        &closed_tx,
        closed_rx.clone(),
    );
    let b_to_a = forward(
        b_read,
        a_write,
        options,
        b_counter.as_ref(),
        &activity_tx,
        &closed_tx,
        closed_rx.clone(),
    );
    let watchdog = idle_watchdog(options.idle_timeout, activity_rx, &closed_tx, closed_rx);

    let ((a_to_b, a_outcome), (b_to_a, b_outcome), idle) =
        tokio::join!(a_to_b, b_to_a, watchdog);
    let stats = BridgeStats { a_to_b, b_to_a };
    debug!(
        a_to_b,
        b_to_a,
        idle,
        a_outcome = ?a_outcome,
        b_outcome = ?b_outcome,
        "Bridge finished"
    );

    for (direction, outcome) in [("a->b", a_outcome), ("b->a", b_outcome)] {
        if let Outcome::Failed(source) = outcome {
            return Err(ProxyError::Forward { direction, source });
        }
    }
    Ok(stats)
}

async fn forward<R, W>(
    mut reader: R,
    mut writer: W,
    options: &BridgeOptions,
    counter: Option<&IntCounter>,
    activity: &watch::Sender<Instant>,
    closed_tx: &watch::Sender<bool>,
    mut closed_rx: watch::Receiver<bool>,
) -> (u64, Outcome)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; options.buffer_size.max(1)];
    let mut total = 0u64;

    let outcome = loop {
        let step = async {
            let n = reader.read(&mut buf).await?;
            if n > 0 {
                activity.send_replace(Instant::now());
                writer.write_all(&buf[..n]).await?;
                writer.flush().await?;
            }
            Ok::<_, io::Error>(n)
        };

        tokio::select! {
            biased;
            _ = closed_rx.changed() => break Outcome::PeerClosed,
            result = step => match result {
                Ok(0) => break Outcome::Eof,
                Ok(n) => {
                    total += n as u64;
                    if let Some(counter) = counter {
                        counter.inc_by(n as u64);
                    }
                }
                // Peer dropped TCP without a TLS close_notify.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break Outcome::Eof,
                Err(e) => break Outcome::Failed(e),
            },
        }
    };

    closed_tx.send_replace(true);
    match timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
        Ok(Err(e)) => debug!(error = %e, "Writer shutdown after teardown"),
        Err(_) => warn!("Writer shutdown timed out"),
        Ok(Ok(())) => {}
    }

    (total, outcome)
}

/// Signals teardown once no data has moved for `limit`. Returns whether it
/// fired; returns `false` as soon as the session closes for another reason.
async fn idle_watchdog(
    limit: Option<Duration>,
    activity: watch::Receiver<Instant>,
    closed_tx: &watch::Sender<bool>,
    mut closed_rx: watch::Receiver<bool>,
) -> bool {
    let Some(limit) = limit else {
        return false;
    };

    loop {
        let deadline = *activity.borrow() + limit;
        tokio::select! {
            biased;
            _ = closed_rx.changed() => return false,
            _ = sleep_until(deadline) => {
                if activity.borrow().elapsed() >= limit {
                    debug!(idle_ms = limit.as_millis() as u64, "Bridge idle, closing");
                    closed_tx.send_replace(true);
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::time::timeout;

    const DEADLINE: Duration = Duration::from_secs(5);

    fn small() -> BridgeOptions {
        BridgeOptions {
            buffer_size: 4096,
            idle_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip_fidelity() {
        let (mut client, a) = duplex(64 * 1024);
        let (b, mut server) = duplex(64 * 1024);
        let bridge = tokio::spawn(async move { bridge(a, b, &small(), None).await });

        let request: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let response: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();

        let expected_request = request.clone();
        let expected_response = response.clone();
        let server_side = tokio::spawn(async move {
            let mut got = vec![0u8; expected_request.len()];
            server.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected_request);
            server.write_all(&expected_response).await.unwrap();
            server
        });

        client.write_all(&request).await.unwrap();
        let mut got = vec![0u8; response.len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, response);

        let _server = server_side.await.unwrap();
        drop(client);

        let stats = timeout(DEADLINE, bridge).await.unwrap().unwrap().unwrap();
        assert_eq!(stats.a_to_b, request.len() as u64);
        assert_eq!(stats.b_to_a, response.len() as u64);
    }

    #[tokio::test]
    async fn test_close_on_one_side_closes_other() {
        let (client, a) = duplex(1024);
        let (b, mut server) = duplex(1024);
        let bridge = tokio::spawn(async move { bridge(a, b, &small(), None).await });

        drop(client);

        let stats = timeout(DEADLINE, bridge)
            .await
            .expect("bridge must return after one side closes")
            .unwrap()
            .unwrap();
        assert_eq!(stats, BridgeStats::default());

        // The upstream end observes EOF: its peer was closed too.
        let mut buf = [0u8; 16];
        let n = timeout(DEADLINE, server.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_close_from_upstream_side() {
        let (mut client, a) = duplex(1024);
        let (b, mut server) = duplex(1024);
        let bridge = tokio::spawn(async move { bridge(a, b, &small(), None).await });

        server.write_all(b"bye").await.unwrap();
        server.shutdown().await.unwrap();

        let mut got = Vec::new();
        timeout(DEADLINE, client.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"bye");

        let stats = timeout(DEADLINE, bridge).await.unwrap().unwrap().unwrap();
        assert_eq!(stats.b_to_a, 3);
        drop(server);
    }

    #[tokio::test]
    async fn test_teardown_unblocks_silent_direction() {
        // The upstream never writes and never closes; the client closing
        // must still end the upstream -> client direction.
        let (mut client, a) = duplex(1024);
        let (b, _server) = duplex(1024);
        let bridge = tokio::spawn(async move { bridge(a, b, &small(), None).await });

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let result = timeout(DEADLINE, bridge).await.expect("no deadlock");
        assert_eq!(result.unwrap().unwrap().a_to_b, 4);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_bridge() {
        let (_client, a) = duplex(1024);
        let (b, _server) = duplex(1024);
        let options = BridgeOptions {
            buffer_size: 1024,
            idle_timeout: Some(Duration::from_millis(50)),
        };

        let result = timeout(DEADLINE, bridge(a, b, &options, None)).await.unwrap();
        assert_eq!(result.unwrap(), BridgeStats::default());
    }

    #[tokio::test]
    async fn test_one_way_stream_outlives_idle_timeout() {
        // The client never writes, but upstream keeps sending for longer
        // than the idle window; the session must stay up until it stops.
        let (mut client, a) = duplex(1024);
        let (b, mut server) = duplex(1024);
        let options = BridgeOptions {
            buffer_size: 1024,
            idle_timeout: Some(Duration::from_millis(100)),
        };
        let bridge = tokio::spawn(async move { bridge(a, b, &options, None).await });

        let upstream = tokio::spawn(async move {
            for _ in 0..12 {
                server.write_all(b"tick.").await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            server
        });

        let mut got = vec![0u8; 60];
        timeout(DEADLINE, client.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"tick.".repeat(12));
        let _server = upstream.await.unwrap();

        // Once upstream goes quiet the shared idle timer closes both sides.
        let stats = timeout(DEADLINE, bridge).await.unwrap().unwrap().unwrap();
        assert_eq!(stats, BridgeStats { a_to_b: 0, b_to_a: 60 });
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_counters_track_bytes() {
        let (mut client, a) = duplex(1024);
        let (b, mut server) = duplex(1024);
        let up = IntCounter::new("up_bytes", "up").unwrap();
        let down = IntCounter::new("down_bytes", "down").unwrap();
        let counters = Some((up.clone(), down.clone()));
        let bridge = tokio::spawn(async move { bridge(a, b, &small(), counters).await });

        client.write_all(b"12345").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        server.write_all(b"678").await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        drop(client);

        timeout(DEADLINE, bridge).await.unwrap().unwrap().unwrap();
        assert_eq!(up.get(), 5);
        assert_eq!(down.get(), 3);
    }

    /// Stream whose reads fail with the given error kind.
    struct Failing(io::ErrorKind);

    impl AsyncRead for Failing {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Err(self.0.into()))
        }
    }

    impl AsyncWrite for Failing {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_io_error_is_forward_error() {
        let (b, mut server) = duplex(1024);
        let result = timeout(
            DEADLINE,
            bridge(Failing(io::ErrorKind::ConnectionReset), b, &small(), None),
        )
        .await
        .unwrap();

        match result {
            Err(ProxyError::Forward { direction, source }) => {
                assert_eq!(direction, "a->b");
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("Expected Forward error, got: {:?}", other),
        }

        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unexpected_eof_is_clean() {
        let (b, _server) = duplex(1024);
        let result = timeout(
            DEADLINE,
            bridge(Failing(io::ErrorKind::UnexpectedEof), b, &small(), None),
        )
        .await
        .unwrap();
        assert!(result.is_ok());
    }
}

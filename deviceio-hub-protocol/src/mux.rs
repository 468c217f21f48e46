//! Mux session handling
//!
//! Treats a single accepted byte stream as a pool of independent
//! bidirectional streams. The hub side runs the mux in client mode: it opens
//! a fresh outbound stream per tunneled HTTP request, while the device side
//! accepts streams and serves them with its local HTTP server.
//!
//! `yamux::Connection` is a poll-driven state machine that must be driven to
//! make any progress, so each session spawns a driver task that owns the
//! connection. Stream opens are requested over a command channel; inbound
//! streams (devices never initiate any) are drained and dropped. When the
//! driver exits for any reason the session's closed flag flips, which is the
//! disconnect signal the gateway watches.

use std::collections::VecDeque;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::debug;
use yamux::{Config, Connection, ConnectionError, Mode};

use crate::{HubError, Result};

/// Commands accepted by the session driver task
enum MuxCommand {
    /// Open a fresh outbound stream and reply with the result
    Open(oneshot::Sender<std::result::Result<yamux::Stream, ConnectionError>>),
    /// Flush a GoAway frame and terminate the session
    Shutdown,
}

/// Handle to one multiplexed device tunnel.
///
/// Cloning the handle is cheap; the session stays alive until `close` is
/// called, every handle is dropped, or the remote side goes away. All
/// sub-streams are transitively closed with the session.
#[derive(Clone)]
pub struct MuxSession {
    commands: mpsc::UnboundedSender<MuxCommand>,
    closed: watch::Receiver<bool>,
}

impl MuxSession {
    /// Wrap an accepted connection in a client-mode mux session and spawn
    /// its driver task.
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Connection::new(io.compat(), Config::default(), Mode::Client);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        tokio::spawn(async move {
            match drive(connection, command_rx).await {
                Ok(()) => debug!("mux session ended"),
                Err(e) => debug!("mux session ended with error: {}", e),
            }
            let _ = closed_tx.send(true);
        });

        Self {
            commands: command_tx,
            closed: closed_rx,
        }
    }

    /// Open a new outbound stream over the session.
    ///
    /// # Errors
    ///
    /// Returns `HubError::SessionClosed` if the session has already shut
    /// down, or `HubError::Mux` if the multiplexer refuses the stream.
    pub async fn open_stream(&self) -> Result<yamux::Stream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(MuxCommand::Open(reply_tx))
            .map_err(|_| HubError::SessionClosed)?;

        match reply_rx.await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(HubError::Mux(e)),
            Err(_) => Err(HubError::SessionClosed),
        }
    }

    /// Request session shutdown. Safe to call from inside a registry lock:
    /// the actual close happens on the driver task.
    pub fn close(&self) {
        let _ = self.commands.send(MuxCommand::Shutdown);
    }

    /// Whether the session has terminated.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session has terminated, however that happened.
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Drive the mux connection: serve open requests, drain inbound streams,
/// and on shutdown flush the close frame.
async fn drive<T>(
    mut connection: Connection<T>,
    mut commands: mpsc::UnboundedReceiver<MuxCommand>,
) -> std::result::Result<(), ConnectionError>
where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let mut pending_open: VecDeque<
        oneshot::Sender<std::result::Result<yamux::Stream, ConnectionError>>,
    > = VecDeque::new();
    let mut shutdown = false;

    futures::future::poll_fn(move |cx: &mut Context<'_>| {
        if !shutdown {
            loop {
                match commands.poll_recv(cx) {
                    Poll::Ready(Some(MuxCommand::Open(reply))) => pending_open.push_back(reply),
                    Poll::Ready(Some(MuxCommand::Shutdown)) | Poll::Ready(None) => {
                        shutdown = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        if shutdown {
            // Pending open requests are dropped here; their callers observe
            // the session as closed.
            pending_open.clear();
            return connection.poll_close(cx);
        }

        while let Some(reply) = pending_open.pop_front() {
            match connection.poll_new_outbound(cx) {
                Poll::Ready(result) => {
                    let _ = reply.send(result);
                }
                Poll::Pending => {
                    pending_open.push_front(reply);
                    break;
                }
            }
        }

        loop {
            match connection.poll_next_inbound(cx) {
                // The hub never accepts device-initiated streams.
                Poll::Ready(Some(Ok(stream))) => drop(stream),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{AsyncReadExt, AsyncWriteExt};
    use std::time::Duration;
    use tokio_util::compat::TokioAsyncReadCompatExt as _;

    /// Drive a server-mode yamux endpoint that echoes one line per stream.
    fn spawn_echo_peer<T>(io: T) -> tokio::task::JoinHandle<()>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        tokio::spawn(async move {
            let mut connection = Connection::new(io.compat(), Config::default(), Mode::Server);
            futures::future::poll_fn(|cx| loop {
                match connection.poll_next_inbound(cx) {
                    Poll::Ready(Some(Ok(mut stream))) => {
                        tokio::spawn(async move {
                            let mut buf = [0u8; 64];
                            if let Ok(n) = stream.read(&mut buf).await {
                                let _ = stream.write_all(&buf[..n]).await;
                                let _ = stream.close().await;
                            }
                        });
                    }
                    Poll::Ready(Some(Err(_))) | Poll::Ready(None) => return Poll::Ready(()),
                    Poll::Pending => return Poll::Pending,
                }
            })
            .await;
        })
    }

    #[tokio::test]
    async fn test_open_stream_round_trip() {
        let (hub_io, device_io) = tokio::io::duplex(64 * 1024);
        let _peer = spawn_echo_peer(device_io);

        let session = MuxSession::new(hub_io);
        let mut stream = session.open_stream().await.unwrap();

        stream.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (hub_io, device_io) = tokio::io::duplex(64 * 1024);
        let _peer = spawn_echo_peer(device_io);

        let session = MuxSession::new(hub_io);
        let mut first = session.open_stream().await.unwrap();
        let mut second = session.open_stream().await.unwrap();

        second.write_all(b"two").await.unwrap();
        first.write_all(b"one").await.unwrap();

        let mut buf = [0u8; 3];
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
    }

    #[tokio::test]
    async fn test_close_flips_closed_flag() {
        let (hub_io, device_io) = tokio::io::duplex(64 * 1024);
        let _peer = spawn_echo_peer(device_io);

        let session = MuxSession::new(hub_io);
        assert!(!session.is_closed());

        session.close();
        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("session should report closed");
        assert!(session.is_closed());

        assert!(matches!(
            session.open_stream().await,
            Err(HubError::SessionClosed) | Err(HubError::Mux(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_drop_closes_session() {
        let (hub_io, device_io) = tokio::io::duplex(64 * 1024);
        let session = MuxSession::new(hub_io);

        drop(device_io);
        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("session should observe peer loss");
    }
}

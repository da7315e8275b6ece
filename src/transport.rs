//! Control-plane transports.
//!
//! Two channel shapes exist, matching the two wire contracts:
//!
//! - **Request/reply**: synchronous one-request-one-reply round trips. The
//!   in-process form pairs an `mpsc` command channel with a `oneshot` responder
//!   per request; callers block until the reply arrives or the transport
//!   timeout elapses. No retry is built in.
//! - **Publish/subscribe**: fan-out broadcast of [`Publication`] messages.
//!
//! The TCP bridge carries the same messages as newline-delimited text so the
//! binaries interoperate across hosts; a slow TCP subscriber that lags the
//! broadcast simply skips ahead, the same policy as any broadcast consumer.

use crate::error::{RcError, RcResult};
use crate::protocol::{Publication, Reply, Request};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

/// Default capacity of in-process control channels.
pub const CHANNEL_CAPACITY: usize = 32;

/// A request paired with its reply slot, as queued toward the authority.
type Envelope = (Request, oneshot::Sender<Reply>);

/// Issues requests and awaits replies.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    /// One blocking round trip. Transport problems (including timeout) are
    /// errors; a FAIL reply is a successful round trip.
    async fn request(&self, request: Request) -> RcResult<Reply>;
}

/// Receives publications in order, skipping none that it can still observe.
#[async_trait]
pub trait SubscribeTransport: Send {
    /// Next publication, or `None` once the channel is closed.
    async fn recv(&mut self) -> Option<Publication>;
}

/// Client half of an in-process request/reply channel.
#[derive(Clone)]
pub struct RequestClient {
    tx: mpsc::Sender<Envelope>,
    timeout: Duration,
}

/// Server half of an in-process request/reply channel.
pub struct RequestServer {
    rx: mpsc::Receiver<Envelope>,
}

/// Reply slot for one received request.
pub struct Responder {
    tx: oneshot::Sender<Reply>,
}

impl Responder {
    /// Sends the reply; a vanished caller is not the server's problem.
    pub fn send(self, reply: Reply) {
        let _ = self.tx.send(reply);
    }
}

/// Creates a connected request/reply channel pair.
pub fn request_channel(timeout: Duration) -> (RequestClient, RequestServer) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (RequestClient { tx, timeout }, RequestServer { rx })
}

#[async_trait]
impl RequestTransport for RequestClient {
    async fn request(&self, request: Request) -> RcResult<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((request, reply_tx))
            .await
            .map_err(|_| RcError::Transport("authority is gone".to_string()))?;
        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RcError::Transport(
                "authority dropped the request without replying".to_string(),
            )),
            Err(_) => Err(RcError::Transport(format!(
                "no reply within {:?}",
                self.timeout
            ))),
        }
    }
}

impl RequestServer {
    /// Waits up to `timeout` for the next request. `None` means the timeout
    /// elapsed or every client is gone.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<(Request, Responder)> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some((request, tx))) => Some((request, Responder { tx })),
            Ok(None) | Err(_) => None,
        }
    }

    /// True once every client handle has been dropped.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

/// Sending side of the publish/subscribe channel.
#[derive(Clone)]
pub struct Publisher {
    tx: broadcast::Sender<Publication>,
}

/// Receiving side of the publish/subscribe channel.
pub struct Subscriber {
    rx: broadcast::Receiver<Publication>,
}

impl Publisher {
    /// Creates a publisher with the given backlog capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcasts one publication. Having no subscribers is not an error.
    pub fn publish(&self, message: Publication) {
        debug!(%message, "publish");
        let _ = self.tx.send(message);
    }

    /// Opens a new subscription starting at the current position.
    pub fn subscribe(&self) -> Subscriber {
        Subscriber {
            rx: self.tx.subscribe(),
        }
    }
}

#[async_trait]
impl SubscribeTransport for Subscriber {
    async fn recv(&mut self) -> Option<Publication> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "subscriber lagged; skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// =============================================================================
// TCP bridge
// =============================================================================

/// Serves the request port: each accepted connection sends newline-delimited
/// requests and receives one reply line per request, forwarded through
/// `client` to the in-process authority.
pub async fn serve_request_port(listener: TcpListener, client: RequestClient) -> RcResult<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "request connection accepted");
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_request_connection(stream, client).await {
                debug!(%peer, %err, "request connection closed");
            }
        });
    }
}

async fn serve_request_connection(stream: TcpStream, client: RequestClient) -> RcResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match line.parse::<Request>() {
            Ok(request) => client
                .request(request)
                .await
                .unwrap_or_else(|err| Reply::Fail(err.to_string())),
            Err(err) => Reply::Fail(err.to_string()),
        };
        write_half
            .write_all(format!("{reply}\n").as_bytes())
            .await?;
    }
    Ok(())
}

/// Serves the subscription port: each accepted connection receives every
/// publication as one line, from its moment of connection onward.
pub async fn serve_pub_port(listener: TcpListener, publisher: Publisher) -> RcResult<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "subscriber connected");
        let mut subscriber = publisher.subscribe();
        tokio::spawn(async move {
            let mut stream = stream;
            while let Some(message) = subscriber.recv().await {
                if stream
                    .write_all(format!("{message}\n").as_bytes())
                    .await
                    .is_err()
                {
                    debug!(%peer, "subscriber disconnected");
                    break;
                }
            }
        });
    }
}

/// Request/reply client over the TCP bridge. One connection per round trip;
/// the control plane is low-rate and the simplicity wins.
pub struct TcpRequestClient {
    addr: String,
    timeout: Duration,
}

impl TcpRequestClient {
    /// Creates a client for `addr` (`host:port`).
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RequestTransport for TcpRequestClient {
    async fn request(&self, request: Request) -> RcResult<Reply> {
        let round_trip = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            stream
                .write_all(format!("{request}\n").as_bytes())
                .await?;
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).await?;
            line.trim_end().parse::<Reply>()
        };
        match tokio::time::timeout(self.timeout, round_trip).await {
            Ok(result) => result,
            Err(_) => Err(RcError::Transport(format!(
                "no reply from {} within {:?}",
                self.addr, self.timeout
            ))),
        }
    }
}

/// Subscription client over the TCP bridge.
pub struct TcpSubscriber {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    // Keeping the write half open keeps the connection alive.
    _write_half: tokio::net::tcp::OwnedWriteHalf,
}

impl TcpSubscriber {
    /// Connects to the subscription port at `addr`.
    pub async fn connect(addr: &str) -> RcResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            _write_half: write_half,
        })
    }
}

#[async_trait]
impl SubscribeTransport for TcpSubscriber {
    async fn recv(&mut self) -> Option<Publication> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => match line.parse::<Publication>() {
                    Ok(message) => return Some(message),
                    Err(err) => warn!(%err, "skipping unparseable publication"),
                },
                Ok(None) => return None,
                Err(err) => {
                    warn!(%err, "subscription stream error");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let (client, mut server) = request_channel(Duration::from_secs(1));
        let serve = tokio::spawn(async move {
            let (request, responder) = server
                .recv_timeout(Duration::from_secs(1))
                .await
                .expect("request expected");
            assert_eq!(request, Request::Run(7));
            responder.send(Reply::Ok);
        });
        let reply = client.request(Request::Run(7)).await.unwrap();
        assert_eq!(reply, Reply::Ok);
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out_without_authority_reply() {
        let (client, mut server) = request_channel(Duration::from_millis(50));
        let hold = tokio::spawn(async move {
            // Receive but never reply; keep the responder alive past the
            // client timeout so the failure is the timeout, not a drop.
            let held = server.recv_timeout(Duration::from_secs(1)).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(held);
        });
        let err = client.request(Request::Title("x".into())).await.unwrap_err();
        assert!(matches!(err, RcError::Transport(_)));
        hold.await.unwrap();
    }

    #[tokio::test]
    async fn test_pubsub_fan_out() {
        let publisher = Publisher::new(16);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();
        publisher.publish(Publication::State("NotReady".into()));
        assert_eq!(a.recv().await, Some(Publication::State("NotReady".into())));
        assert_eq!(b.recv().await, Some(Publication::State("NotReady".into())));
    }

    #[tokio::test]
    async fn test_tcp_bridge_round_trip() {
        let (client, mut server) = request_channel(Duration::from_secs(1));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_request_port(listener, client));
        tokio::spawn(async move {
            while let Some((request, responder)) = server.recv_timeout(Duration::from_secs(5)).await
            {
                match request {
                    Request::Transition(name) if name == "Readying" => responder.send(Reply::Ok),
                    _ => responder.send(Reply::Fail("not now".into())),
                }
            }
        });

        let tcp = TcpRequestClient::new(addr, Duration::from_secs(1));
        assert_eq!(
            tcp.request(Request::Transition("Readying".into()))
                .await
                .unwrap(),
            Reply::Ok
        );
        assert_eq!(
            tcp.request(Request::Run(1)).await.unwrap(),
            Reply::Fail("not now".into())
        );
    }

    #[tokio::test]
    async fn test_tcp_subscription_stream() {
        let publisher = Publisher::new(16);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_pub_port(listener, publisher.clone()));

        let mut subscriber = TcpSubscriber::connect(&addr).await.unwrap();
        // Give the accept loop a moment to register the subscription.
        tokio::time::sleep(Duration::from_millis(50)).await;
        publisher.publish(Publication::Title("beam: on".into()));
        assert_eq!(
            subscriber.recv().await,
            Some(Publication::Title("beam: on".into()))
        );
    }
}

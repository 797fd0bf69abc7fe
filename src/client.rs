//! RPC client: one connection shared by every caller.
//!
//! Calls are handed to a connection task through a channel. The task
//! tags each request with an id, writes it, and routes the response with
//! the same id back to the waiting caller. Responses may arrive in any
//! order.

use crate::error::CallError;
use crate::protocol::{self, Frame};
use crate::service::EchoClient;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

/// Read/write buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Calls queued for the connection task before callers wait.
const CALL_QUEUE: usize = 1024;

type Reply = oneshot::Sender<Result<Bytes, CallError>>;

struct Call {
    id: u64,
    key: Bytes,
    reply: Reply,
}

/// Handle to a connection. Share it behind an `Arc`.
pub struct RpcClient {
    calls: mpsc::Sender<Call>,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Open the connection. Fails once, up front, if the server is not
    /// reachable.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(peer = %stream.peer_addr()?, "Connected");
        Ok(Self::from_stream(stream))
    }

    /// Drive calls over an already established stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (calls, rx) = mpsc::channel(CALL_QUEUE);
        tokio::spawn(async move {
            if let Err(e) = connection_task(stream, rx).await {
                debug!(error = %e, "Connection closed");
            }
        });

        RpcClient {
            calls,
            // Id 0 is what the server uses for errors it cannot attribute
            next_id: AtomicU64::new(1),
        }
    }
}

impl EchoClient for RpcClient {
    async fn get(&self, key: Bytes) -> Result<Bytes, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();

        self.calls
            .send(Call { id, key, reply })
            .await
            .map_err(|_| CallError::Disconnected)?;

        response.await.map_err(|_| CallError::Disconnected)?
    }
}

/// Own the stream: write queued calls, read responses, route them by id.
///
/// Reading never waits on a pending write. With large keys the server may
/// stop reading requests until its responses are drained, so both
/// directions must make progress at once.
///
/// Every call still pending when the connection ends gets the error that
/// ended it.
async fn connection_task<S>(
    stream: S,
    mut calls: mpsc::Receiver<Call>,
) -> Result<(), CallError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut pending: HashMap<u64, Reply> = HashMap::new();
    let mut read_buf = BytesMut::with_capacity(BUFFER_SIZE);
    let mut write_buf = BytesMut::with_capacity(BUFFER_SIZE);

    let result = loop {
        tokio::select! {
            call = calls.recv() => {
                let Some(call) = call else {
                    // Every handle dropped
                    break Ok(());
                };
                enqueue(call, &mut pending, &mut write_buf);
                while let Ok(call) = calls.try_recv() {
                    enqueue(call, &mut pending, &mut write_buf);
                }
            }
            written = writer.write_buf(&mut write_buf), if !write_buf.is_empty() => {
                match written {
                    Ok(0) => {
                        let e = io::Error::from(io::ErrorKind::WriteZero);
                        break Err(CallError::from(e));
                    }
                    Ok(_) => {}
                    Err(e) => break Err(CallError::from(e)),
                }
            }
            read = reader.read_buf(&mut read_buf) => {
                match read {
                    Ok(0) => break Err(CallError::Disconnected),
                    Ok(_) => {}
                    Err(e) => break Err(CallError::from(e)),
                }
                if let Err(e) = dispatch(&mut read_buf, &mut pending) {
                    break Err(e);
                }
            }
        }
    };

    let error = match &result {
        Ok(()) => CallError::Disconnected,
        Err(e) => e.clone(),
    };
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(error.clone()));
    }

    result
}

fn enqueue(call: Call, pending: &mut HashMap<u64, Reply>, write_buf: &mut BytesMut) {
    trace!(id = call.id, len = call.key.len(), "Sending Get");
    protocol::encode(
        &Frame::Get {
            id: call.id,
            key: call.key,
        },
        write_buf,
    );
    pending.insert(call.id, call.reply);
}

/// Route every complete response frame in `read_buf` to its caller.
fn dispatch(
    read_buf: &mut BytesMut,
    pending: &mut HashMap<u64, Reply>,
) -> Result<(), CallError> {
    loop {
        match protocol::decode(read_buf) {
            Ok(Some(Frame::Value { id, value })) => complete(pending, id, Ok(value))?,
            Ok(Some(Frame::Error { id, message })) => {
                complete(pending, id, Err(CallError::Remote(message)))?
            }
            Ok(Some(frame)) => {
                return Err(CallError::Protocol(format!("unexpected frame {frame:?}")));
            }
            Ok(None) => return Ok(()),
            Err(e) => return Err(CallError::Protocol(e.to_string())),
        }
    }
}

fn complete(
    pending: &mut HashMap<u64, Reply>,
    id: u64,
    result: Result<Bytes, CallError>,
) -> Result<(), CallError> {
    match pending.remove(&id) {
        Some(reply) => {
            // The caller may have stopped waiting
            let _ = reply.send(result);
            Ok(())
        }
        None => Err(CallError::Protocol(format!("response for unknown id {id}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerSettings;
    use crate::server::Server;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio_util::sync::CancellationToken;

    /// Read request frames off `stream` until `count` have arrived.
    async fn read_requests(stream: &mut DuplexStream, count: usize) -> Vec<(u64, Bytes)> {
        let mut buf = BytesMut::new();
        let mut requests = Vec::new();
        while requests.len() < count {
            match protocol::decode(&mut buf).unwrap() {
                Some(Frame::Get { id, key }) => requests.push((id, key)),
                Some(other) => panic!("unexpected: {:?}", other),
                None => {
                    let n = stream.read_buf(&mut buf).await.unwrap();
                    assert!(n > 0, "client closed early");
                }
            }
        }
        requests
    }

    async fn reply(stream: &mut DuplexStream, frame: Frame) {
        let mut out = BytesMut::new();
        protocol::encode(&frame, &mut out);
        stream.write_all(&out).await.unwrap();
    }

    #[tokio::test]
    async fn test_responses_routed_by_id() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let client = RpcClient::from_stream(client_side);

        let server = tokio::spawn(async move {
            let requests = read_requests(&mut server_side, 2).await;
            // Answer in reverse order
            for (id, key) in requests.into_iter().rev() {
                reply(&mut server_side, Frame::Value { id, value: key }).await;
            }
            server_side
        });

        let (a, b) = tokio::join!(client.get(Bytes::from("a")), client.get(Bytes::from("b")));
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_remote_error() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let client = RpcClient::from_stream(client_side);

        let server = tokio::spawn(async move {
            let requests = read_requests(&mut server_side, 1).await;
            let message = "boom".to_string();
            reply(&mut server_side, Frame::Error { id: requests[0].0, message }).await;
            server_side
        });

        match client.get(Bytes::from("key")).await {
            Err(CallError::Remote(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected: {:?}", other),
        }
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_id_tears_down_connection() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let client = RpcClient::from_stream(client_side);

        let server = tokio::spawn(async move {
            read_requests(&mut server_side, 1).await;
            let value = Bytes::from("key");
            reply(&mut server_side, Frame::Value { id: 999, value }).await;
            server_side
        });

        assert!(matches!(
            client.get(Bytes::from("key")).await,
            Err(CallError::Protocol(_))
        ));
        drop(server.await.unwrap());

        // The connection task is gone; later calls fail fast
        assert!(matches!(
            client.get(Bytes::from("key")).await,
            Err(CallError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_pending_call_fails_when_server_hangs_up() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let client = RpcClient::from_stream(client_side);

        tokio::spawn(async move {
            read_requests(&mut server_side, 1).await;
            drop(server_side);
        });

        assert!(matches!(
            client.get(Bytes::from("key")).await,
            Err(CallError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_calls_over_tcp() {
        let settings = ServerSettings {
            listen: "127.0.0.1:0".to_string(),
            max_connections: 4,
        };
        let server = Server::bind(&settings).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));

        let client = Arc::new(RpcClient::connect(&addr).await.unwrap());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let client = Arc::clone(&client);
            tasks.push(tokio::spawn(async move {
                let key = Bytes::from(format!("key-{i}"));
                for _ in 0..10 {
                    let value = client.get(key.clone()).await.unwrap();
                    assert_eq!(value, key);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_large_keys_in_flight_do_not_stall() {
        let settings = ServerSettings {
            listen: "127.0.0.1:0".to_string(),
            max_connections: 4,
        };
        let server = Server::bind(&settings).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));

        // Far more request bytes in flight than the socket buffers hold
        let client = Arc::new(RpcClient::connect(&addr).await.unwrap());
        let key = Bytes::from(vec![b'x'; 1024 * 1024]);
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let client = Arc::clone(&client);
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..4 {
                    let value = client.get(key.clone()).await.unwrap();
                    assert_eq!(value.len(), key.len());
                }
            }));
        }

        let all = async {
            for task in tasks {
                task.await.unwrap();
            }
        };
        tokio::time::timeout(Duration::from_secs(20), all)
            .await
            .expect("calls with 1MiB keys from 32 tasks did not complete");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to find a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(RpcClient::connect(&addr).await.is_err());
    }
}

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::error::{Error, Result};
use crate::types::{Arg, Request, Response};
use crate::utils::{read_frame, write_frame};

/// `None` once the connection is gone.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Response>>>>>;

/// AsyncClient multiplexes calls from any number of tasks over a single
/// connection. Clones share the connection.
#[derive(Clone)]
pub struct AsyncClient {
    inner: Arc<Inner>,
}

struct Inner {
    writer: AsyncMutex<OwnedWriteHalf>,
    pending: Pending,
    seq: AtomicU64,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl AsyncClient {
    #[instrument]
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader = tokio::spawn(read_loop(BufReader::new(read_half), Arc::clone(&pending)));

        Ok(AsyncClient {
            inner: Arc::new(Inner {
                writer: AsyncMutex::new(write_half),
                pending,
                seq: AtomicU64::new(0),
                reader,
            }),
        })
    }

    /// call invokes `method` on the server and waits for its reply.
    #[instrument(skip(self))]
    pub async fn call(&self, method: &str, arg: &Arg) -> Result<String> {
        let id = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock();
            match pending.as_mut() {
                Some(calls) => {
                    calls.insert(id, tx);
                }
                None => return Err(Error::Shutdown),
            }
        }

        let req = Request {
            id,
            method: method.to_string(),
            arg: arg.clone(),
        };
        let sent = {
            let mut writer = self.inner.writer.lock().await;
            write_frame(&mut *writer, &req).await
        };
        if let Err(e) = sent {
            if let Some(calls) = self.inner.pending.lock().as_mut() {
                calls.remove(&id);
            }
            return Err(e);
        }

        trace!(id, "request sent, waiting for reply");
        let resp = rx.await.map_err(|_| Error::Shutdown)?;
        resp.into_result()
    }
}

impl fmt::Debug for AsyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncClient")
            .field("seq", &self.inner.seq.load(Ordering::Relaxed))
            .finish()
    }
}

async fn read_loop(mut reader: BufReader<OwnedReadHalf>, pending: Pending) {
    loop {
        match read_frame::<_, Response>(&mut reader).await {
            Ok(Some(resp)) => {
                let waiter = pending
                    .lock()
                    .as_mut()
                    .and_then(|calls| calls.remove(&resp.id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => warn!(id = resp.id, "response for unknown request"),
                }
            }
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "reading response failed");
                break;
            }
        }
    }
    // Dropping the senders fails every outstanding call.
    pending.lock().take();
}

#[cfg(test)]
mod tests {
    use super::AsyncClient;
    use crate::error::Error;
    use crate::types::{Arg, GET_DATA};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_call_fails_when_connection_drops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            // hang up without answering
        });

        let client = AsyncClient::connect(&addr).await.unwrap();
        let res = client.call(GET_DATA, &Arg { caller: 0 }).await;
        assert!(matches!(res, Err(Error::Shutdown)));

        let res = client.call(GET_DATA, &Arg { caller: 1 }).await;
        assert!(matches!(res, Err(Error::Shutdown)));
    }
}

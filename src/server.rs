//! The RPC server the demo callers talk to.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::types::{Arg, Options, Request, Response, GET_DATA};
use crate::utils::{read_frame, write_frame};

/// Data is the service behind `Data.GetData`: a deliberately slow data source.
#[derive(Debug)]
pub struct Data {
    delay: Duration,
    reply: String,
    served: AtomicUsize,
}

impl Data {
    pub fn new(delay: Duration, reply: impl Into<String>) -> Self {
        Data {
            delay,
            reply: reply.into(),
            served: AtomicUsize::new(0),
        }
    }

    pub async fn get_data(&self, arg: &Arg) -> Result<String> {
        info!(caller = arg.caller, "Request from client {}", arg.caller);
        self.served.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        Ok(self.reply.clone())
    }

    /// Requests handled so far.
    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    async fn dispatch(&self, req: &Request) -> Result<String> {
        match req.method.as_str() {
            GET_DATA => self.get_data(&req.arg).await,
            method => Err(Error::Remote(format!("rpc: can't find method {method}"))),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    data: Arc<Data>,
}

impl Server {
    #[instrument(skip(options))]
    pub async fn bind(addr: &str, options: &Options) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server {
            listener,
            data: Arc::new(Data::new(options.server_delay, options.reply.clone())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn data(&self) -> Arc<Data> {
        Arc::clone(&self.data)
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Starting RPC server...");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "accepted connection");
            let data = Arc::clone(&self.data);
            tokio::spawn(async move {
                if let Err(e) = serve_conn(stream, data).await {
                    warn!(%peer, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Requests on one connection run concurrently; responses go out in
/// completion order and are matched to requests by id.
async fn serve_conn(stream: TcpStream, data: Arc<Data>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();

    let writer = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            write_frame(&mut write_half, &resp).await?;
        }
        Ok::<_, Error>(())
    });

    while let Some(req) = read_frame::<_, Request>(&mut reader).await? {
        let data = Arc::clone(&data);
        let tx = tx.clone();
        tokio::spawn(async move {
            let resp = match data.dispatch(&req).await {
                Ok(reply) => Response::reply(req.id, reply),
                Err(e) => Response::error(req.id, e.to_string()),
            };
            let _ = tx.send(resp);
        });
    }
    drop(tx);

    match writer.await {
        Ok(res) => res,
        Err(e) => Err(Error::Io(io::Error::other(e))),
    }
}

//! A small RPC server and two clients that push many concurrent, identical
//! calls through a [`singleflight`] group, so the server sees one request per
//! flight no matter how many callers asked.

pub mod async_client;
pub mod client;
pub mod error;
pub mod server;
mod types;
mod utils;

use singleflight::{AsyncGroup, Group};
use std::sync::{mpsc, Arc};
use threadpool::ThreadPool;
use tokio::task::JoinSet;
use tracing::{info, instrument};

pub use async_client::AsyncClient;
pub use client::Client;
pub use error::{Error, Result, SharedError};
pub use server::{Data, Server};
pub use types::{Arg, Options, Request, Response, GET_DATA};

/// What each caller got back, ordered by caller.
#[derive(Debug, Default)]
pub struct Report {
    pub replies: Vec<(usize, std::result::Result<String, SharedError>)>,
}

impl Report {
    pub fn succeeded(&self) -> usize {
        self.replies.iter().filter(|(_, reply)| reply.is_ok()).count()
    }

    fn sorted(mut self) -> Self {
        self.replies.sort_by_key(|(caller, _)| *caller);
        self
    }
}

/// run starts `options.callers` tasks that all fetch `Data.GetData` under
/// `options.key`. Callers that overlap share one request.
#[instrument(skip(client, options), fields(key = %options.key, callers = options.callers))]
pub async fn run(client: AsyncClient, options: &Options) -> Result<Report> {
    let group: AsyncGroup<String, SharedError> = AsyncGroup::new();
    let mut tasks = JoinSet::new();

    for caller in 0..options.callers {
        let group = group.clone();
        let client = client.clone();
        let key = options.key.clone();
        tasks.spawn(async move {
            let reply = group
                .work(key.as_str(), move || async move {
                    client
                        .call(GET_DATA, &Arg { caller })
                        .await
                        .map_err(Arc::new)
                })
                .await;
            (caller, reply)
        });
    }

    let mut report = Report::default();
    while let Some(joined) = tasks.join_next().await {
        report.replies.push(joined?);
    }
    info!(succeeded = report.succeeded(), "all callers returned");
    Ok(report.sorted())
}

/// run_blocking is [`run`] on plain threads with the blocking [`Group`].
#[instrument(skip(client, options), fields(key = %options.key, callers = options.callers))]
pub fn run_blocking(client: Arc<Client>, options: &Options) -> Report {
    let group: Group<String, SharedError> = Group::new();
    let pool = ThreadPool::new(options.callers.max(1));
    let (tx, rx) = mpsc::channel();

    for caller in 0..options.callers {
        let group = group.clone();
        let client = Arc::clone(&client);
        let key = options.key.clone();
        let tx = tx.clone();
        pool.execute(move || {
            let reply = group.work(key.as_str(), || {
                client.call(GET_DATA, &Arg { caller }).map_err(Arc::new)
            });
            let _ = tx.send((caller, reply));
        });
    }
    drop(tx);

    // Ends once every job has sent its reply or unwound.
    let report = Report {
        replies: rx.iter().collect(),
    };
    info!(succeeded = report.succeeded(), "all callers returned");
    report.sorted()
}

#[cfg(test)]
mod tests {
    use super::{run, run_blocking, AsyncClient, Client, Error, Options, Server};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::runtime::Runtime;
    use tokio::time::sleep;
    use tracing_test::traced_test;

    fn options() -> Options {
        Options {
            addr: "127.0.0.1:0".to_string(),
            callers: 20,
            server_delay: Duration::from_millis(300),
            ..Options::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    #[traced_test]
    async fn test_run_sends_one_request_per_flight() {
        let options = options();
        let server = Server::bind(&options.addr, &options).await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let data = server.data();
        tokio::spawn(server.serve());

        let client = AsyncClient::connect(&addr).await.unwrap();
        let report = run(client, &options).await.unwrap();

        assert_eq!(report.replies.len(), 20);
        assert_eq!(report.succeeded(), 20);
        for (i, (caller, reply)) in report.replies.iter().enumerate() {
            assert_eq!(*caller, i);
            assert_eq!(reply.as_deref().unwrap(), options.reply);
        }
        assert_eq!(data.served(), 1);
    }

    #[tokio::test]
    async fn test_run_shares_one_error_between_callers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            sleep(Duration::from_millis(200)).await;
            // hang up without answering
        });

        let client = AsyncClient::connect(&addr).await.unwrap();
        let options = Options {
            callers: 10,
            ..options()
        };
        let report = run(client, &options).await.unwrap();

        assert_eq!(report.succeeded(), 0);
        let errs: Vec<_> = report
            .replies
            .iter()
            .map(|(_, reply)| reply.as_ref().unwrap_err())
            .collect();
        assert!(matches!(**errs[0], Error::Shutdown));
        for err in &errs[1..] {
            assert!(Arc::ptr_eq(err, errs[0]));
        }
    }

    #[test]
    fn test_run_blocking_sends_one_request_per_flight() {
        let rt = Runtime::new().unwrap();
        let options = options();
        let server = rt.block_on(Server::bind(&options.addr, &options)).unwrap();
        let addr = server.local_addr().unwrap();
        let data = server.data();
        rt.spawn(server.serve());

        let client = Arc::new(Client::connect(addr).unwrap());
        let report = run_blocking(client, &options);

        assert_eq!(report.succeeded(), 20);
        assert!(report
            .replies
            .iter()
            .all(|(_, reply)| reply.as_deref().unwrap() == options.reply));
        assert_eq!(data.served(), 1);
    }

    #[test]
    fn test_run_blocking_without_callers() {
        let rt = Runtime::new().unwrap();
        let options = Options {
            callers: 0,
            ..options()
        };
        let server = rt.block_on(Server::bind(&options.addr, &options)).unwrap();
        let addr = server.local_addr().unwrap();
        rt.spawn(server.serve());

        let report = run_blocking(Arc::new(Client::connect(addr).unwrap()), &options);
        assert!(report.replies.is_empty());
    }
}

//! singleflight-rpc CLI: run the demo server, its callers, or both.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use singleflight_rpc::{run, run_blocking, AsyncClient, Client, Options, Report, Server};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "singleflight-rpc",
    about = "Concurrent identical RPC calls, deduplicated by key"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the RPC server
    Serve(OptionsArgs),
    /// Fire concurrent callers at a running server
    Call {
        #[command(flatten)]
        options: OptionsArgs,
        /// Use threads and the blocking client instead of tasks
        #[arg(long)]
        blocking: bool,
    },
    /// Start the server in-process and run the callers against it
    Demo {
        #[command(flatten)]
        options: OptionsArgs,
        /// Use threads and the blocking client instead of tasks
        #[arg(long)]
        blocking: bool,
    },
}

/// Overrides for [`Options`]; unset flags keep the defaults.
#[derive(Args)]
struct OptionsArgs {
    /// Address to listen on / dial [default: 127.0.0.1:1234]
    #[arg(long)]
    addr: Option<String>,
    /// Flight key shared by every caller [default: foo]
    #[arg(long)]
    key: Option<String>,
    /// Number of concurrent callers [default: 100]
    #[arg(long)]
    callers: Option<usize>,
    /// Server work time per request, in milliseconds [default: 1000]
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Server reply text
    #[arg(long)]
    reply: Option<String>,
}

impl From<OptionsArgs> for Options {
    fn from(args: OptionsArgs) -> Self {
        let mut options = Options::default();
        if let Some(addr) = args.addr {
            options.addr = addr;
        }
        if let Some(key) = args.key {
            options.key = key;
        }
        if let Some(callers) = args.callers {
            options.callers = callers;
        }
        if let Some(delay_ms) = args.delay_ms {
            options.server_delay = Duration::from_millis(delay_ms);
        }
        if let Some(reply) = args.reply {
            options.reply = reply;
        }
        options
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let options = Options::from(args);
            Server::bind(&options.addr, &options).await?.serve().await?;
        }
        Command::Call { options, blocking } => {
            let options = Options::from(options);
            let report = call(&options, blocking).await?;
            print_report(&report);
        }
        Command::Demo { options, blocking } => {
            let mut options = Options::from(options);
            let server = Server::bind(&options.addr, &options).await?;
            options.addr = server.local_addr()?.to_string();
            let data = server.data();
            let serving = tokio::spawn(server.serve());

            let report = call(&options, blocking).await?;
            print_report(&report);
            println!(
                "server handled {} request(s) for {} callers",
                data.served(),
                report.replies.len()
            );
            serving.abort();
        }
    }
    Ok(())
}

async fn call(options: &Options, blocking: bool) -> Result<Report> {
    if blocking {
        let options = options.clone();
        // The callers park their threads; keep them off the runtime workers.
        let report = tokio::task::spawn_blocking(move || -> Result<Report> {
            let client = Arc::new(Client::connect(options.addr.as_str())?);
            Ok(run_blocking(client, &options))
        })
        .await??;
        return Ok(report);
    }
    let client = AsyncClient::connect(&options.addr).await?;
    Ok(run(client, options).await?)
}

fn print_report(report: &Report) {
    for (caller, reply) in &report.replies {
        match reply {
            Ok(result) => println!("caller: {caller} get result: {result}"),
            Err(e) => println!("caller: {caller} failed: {e}"),
        }
    }
}

mod hub;
mod relay;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use streamcore::httpflv::HttpFlvServer;
use streamcore::rtmp::RtmpServer;
use streamcore::rtsp::RtspServer;
use streamcore::{Result, Runtime};
use tracing_subscriber::EnvFilter;

use crate::hub::Hub;

#[derive(Parser)]
#[command(
    name = "streamcore",
    about = "RTMP, RTSP and HTTP-FLV streaming server and relay"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept publishers and players, routed to each other by stream name
    Serve {
        #[arg(long, default_value = "0.0.0.0:1935")]
        rtmp_listen: String,
        #[arg(long, default_value = "0.0.0.0:8554")]
        rtsp_listen: String,
        #[arg(long, default_value = "0.0.0.0:8080")]
        httpflv_listen: String,
        /// Require RTSP Digest credentials, given as user:password
        #[arg(long, value_parser = parse_credentials)]
        rtsp_auth: Option<(String, String)>,
    },
    /// Pull one stream and push it to another server
    Relay {
        /// rtmp:// or rtsp:// source
        #[arg(long)]
        from: String,
        /// rtmp:// or rtsp:// destination
        #[arg(long)]
        to: String,
        /// Carry RTSP media interleaved on the TCP connection
        #[arg(long)]
        tcp: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let runtime = Runtime::default();
    let result = match args.command {
        Command::Serve {
            rtmp_listen,
            rtsp_listen,
            httpflv_listen,
            rtsp_auth,
        } => serve(runtime, &rtmp_listen, &rtsp_listen, &httpflv_listen, rtsp_auth).await,
        Command::Relay { from, to, tcp } => relay::run(runtime, &from, &to, tcp).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn serve(
    runtime: Runtime,
    rtmp_listen: &str,
    rtsp_listen: &str,
    httpflv_listen: &str,
    rtsp_auth: Option<(String, String)>,
) -> Result<()> {
    let hub = Arc::new(Hub::new(runtime.clone()));

    let rtmp = Arc::new(RtmpServer::new(rtmp_listen, hub.clone(), runtime.clone()));
    let mut rtsp = RtspServer::new(rtsp_listen, hub.clone(), runtime.clone());
    if let Some((user, pass)) = rtsp_auth {
        rtsp = rtsp.with_digest_auth(&runtime.config.library_name, &user, &pass);
    }
    let rtsp = Arc::new(rtsp);
    let flv = Arc::new(HttpFlvServer::new(httpflv_listen, hub.clone(), runtime.clone()));

    rtmp.listen().await?;
    rtsp.listen().await?;
    flv.listen().await?;

    let tasks = [
        tokio::spawn({
            let s = rtmp.clone();
            async move { s.run_loop().await }
        }),
        tokio::spawn({
            let s = rtsp.clone();
            async move { s.run_loop().await }
        }),
        tokio::spawn({
            let s = flv.clone();
            async move { s.run_loop().await }
        }),
    ];

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    rtmp.dispose();
    rtsp.dispose();
    flv.dispose();
    for task in tasks {
        match task.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "server stopped with error"),
            Err(e) => tracing::warn!(error = %e, "server task failed"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}

fn parse_credentials(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once(':')
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .ok_or_else(|| "expected user:password".to_string())
}

//! callcapture - join a call session, record the local stream in slices and
//! upload every slice to the backend.
//!
//! Usage:
//!   callcapture [--server URL] [--session ID] [--practice SCENARIO_ID]
//!               [--participant ID] [--config FILE] [--wait-report]
//!
//! Without --session a new session is created. Press Ctrl+C to end the call.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use callcapture::media::{FramedCaptureBackend, SyntheticSource};
use callcapture::rtc::WebRtcTransportFactory;
use callcapture::{BackendClient, CallController, ClientConfig, SessionKind};

const UPLOAD_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const REPORT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const REPORT_MAX_POLLS: u32 = 90;

#[derive(Default)]
struct Args {
    server: Option<String>,
    session: Option<String>,
    practice: Option<String>,
    participant: Option<String>,
    config: Option<PathBuf>,
    wait_report: bool,
}

fn usage() {
    eprintln!("callcapture - record and upload a call session");
    eprintln!();
    eprintln!("Usage: callcapture [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --server <URL>         Backend base URL [default: http://127.0.0.1:8000]");
    eprintln!("      --session <ID>         Join an existing session instead of creating one");
    eprintln!("      --practice <SCENARIO>  Start a solo practice session for a scenario");
    eprintln!("      --participant <ID>     Participant id [default: random]");
    eprintln!("  -c, --config <FILE>        JSON client config");
    eprintln!("      --wait-report          Poll for the report after the call ends");
    eprintln!("  -h, --help                 Show this help message");
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args::default();

    let value = |i: usize| -> String {
        match argv.get(i + 1) {
            Some(v) => v.clone(),
            None => {
                eprintln!("Error: {} requires an argument", argv[i]);
                std::process::exit(1);
            }
        }
    };

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "-s" | "--server" => {
                args.server = Some(value(i));
                i += 2;
            }
            "--session" => {
                args.session = Some(value(i));
                i += 2;
            }
            "--practice" => {
                args.practice = Some(value(i));
                i += 2;
            }
            "--participant" => {
                args.participant = Some(value(i));
                i += 2;
            }
            "-c" | "--config" => {
                args.config = Some(PathBuf::from(value(i)));
                i += 2;
            }
            "--wait-report" => {
                args.wait_report = true;
                i += 1;
            }
            "-h" | "--help" => {
                usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown option: {}", other);
                usage();
                std::process::exit(1);
            }
        }
    }
    args
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args();

    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if let Some(participant) = args.participant {
        config.participant_id = Some(participant);
    }
    if args.practice.is_some() {
        config.session_kind = SessionKind::Practice;
    }

    let backend = BackendClient::new(config.http_base())?;
    let session_id = match (args.session, &args.practice) {
        (Some(id), _) => id,
        (None, Some(scenario)) => backend.start_practice(scenario).await?,
        (None, None) => backend.create_session().await?,
    };
    let kind = config.session_kind;

    let factory = Arc::new(WebRtcTransportFactory::new(config.ice_servers.clone()));
    let mut controller = CallController::start(
        config,
        &session_id,
        &SyntheticSource::new(),
        &FramedCaptureBackend::new(),
        factory,
    )
    .await?;

    log::info!(
        "In session {} as {} (Press Ctrl+C to end the call)",
        session_id,
        controller.participant_id()
    );

    let uploads = controller.take_uploads();
    let handle = controller.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl+C, ending call...");
            handle.end_call();
        }
    });

    let outcome = controller.run().await;
    log::info!("Call over, report at {}", outcome.report_page());
    drop(controller);

    if let Some(uploads) = uploads {
        match tokio::time::timeout(UPLOAD_DRAIN_TIMEOUT, uploads).await {
            Ok(Ok(summary)) if summary.failed.is_empty() => {
                log::info!("All {} chunks uploaded", summary.uploaded.len());
            }
            Ok(Ok(summary)) => {
                log::warn!("Chunks not uploaded: {:?}", summary.failed);
            }
            Ok(Err(e)) => log::error!("Upload task failed: {}", e),
            Err(_) => log::warn!("Gave up waiting for uploads after {:?}", UPLOAD_DRAIN_TIMEOUT),
        }
    }

    if args.wait_report {
        match backend
            .wait_for_report(kind, &session_id, REPORT_POLL_INTERVAL, REPORT_MAX_POLLS)
            .await?
        {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => log::warn!("Report for {} not ready yet", session_id),
        }
    }

    Ok(())
}

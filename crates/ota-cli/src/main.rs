use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use ota_proto::ota::v1::{
    status_event::Payload, updater_service_client::UpdaterServiceClient,
    ApplyUpdateRequest, CheckAndApplyUpdateRequest, CheckForUpdateRequest, GetStatusRequest,
    ResumeUpdateRequest, StatusSnapshot, StreamStatusRequest, SuspendUpdateRequest, UpdateState,
};
use tonic::transport::Channel;

#[derive(Parser)]
#[command(name = "ota-cli", version, about = "OTA updater CLI")]
struct Cli {
    #[arg(long, global = true, default_value_t = ota_util::updater_addr())]
    addr: String,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show the current update status
    Status,
    /// Check for a newer build
    Check {
        /// Release channel; defaults to the daemon's configured channel
        #[arg(long, default_value = "")]
        channel: String,
    },
    /// Apply the update found by the last check
    Apply,
    /// Check for a newer build and apply it right away
    CheckAndApply {
        #[arg(long, default_value = "")]
        channel: String,
    },
    /// Pause a running download
    Suspend,
    /// Continue a paused download
    Resume,
    /// Stream status and progress events
    Watch {
        #[arg(long)]
        history: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut client = UpdaterServiceClient::new(connect(&cli.addr).await?);

    match cli.cmd {
        Cmd::Status => {
            let resp = client.get_status(GetStatusRequest {}).await?.into_inner();
            print_status(resp.status.as_ref());
        }
        Cmd::Check { channel } => {
            let resp = client
                .check_for_update(CheckForUpdateRequest { channel })
                .await?
                .into_inner();
            println!("update_available={}", resp.update_available);
            print_status(resp.status.as_ref());
        }
        Cmd::Apply => {
            let resp = client.apply_update(ApplyUpdateRequest {}).await?.into_inner();
            println!("accepted={}", resp.accepted);
            print_status(resp.status.as_ref());
        }
        Cmd::CheckAndApply { channel } => {
            let resp = client
                .check_and_apply_update(CheckAndApplyUpdateRequest { channel })
                .await?
                .into_inner();
            println!(
                "update_available={}\taccepted={}",
                resp.update_available, resp.accepted
            );
            print_status(resp.status.as_ref());
        }
        Cmd::Suspend => {
            let resp = client.suspend_update(SuspendUpdateRequest {}).await?.into_inner();
            println!("accepted={}", resp.accepted);
            print_status(resp.status.as_ref());
        }
        Cmd::Resume => {
            let resp = client.resume_update(ResumeUpdateRequest {}).await?.into_inner();
            println!("accepted={}", resp.accepted);
            print_status(resp.status.as_ref());
        }
        Cmd::Watch { history } => {
            let mut stream = client
                .stream_status(StreamStatusRequest {
                    include_history: history,
                })
                .await?
                .into_inner();
            while let Some(event) = stream.next().await {
                let event = event?;
                let at = event.at.map(|t| t.unix_millis).unwrap_or_default();
                match event.payload {
                    Some(Payload::StatusChanged(changed)) => {
                        println!("[{}] #{} {}", at, event.seq, state_name(changed.state));
                    }
                    Some(Payload::ProgressUpdated(progress)) => {
                        println!("[{}] progress {}%", at, progress.percent);
                    }
                    None => {}
                }
            }
        }
    }

    Ok(())
}

fn state_name(state: i32) -> &'static str {
    UpdateState::try_from(state)
        .map(|s| s.as_str_name())
        .unwrap_or("UPDATE_STATE_UNSPECIFIED")
        .trim_start_matches("UPDATE_STATE_")
}

fn print_status(status: Option<&StatusSnapshot>) {
    let Some(status) = status else {
        return;
    };
    println!(
        "state={}\tprogress={}%\tfailed={}",
        state_name(status.state),
        status.progress_percent,
        status.update_failed
    );
    if let Some(manifest) = status.manifest.as_ref() {
        println!(
            "update={}\tbuild_date_utc={}\tversion={}\tsize={}",
            manifest.name, manifest.build_date_utc, manifest.version, manifest.payload_size_bytes
        );
        if !manifest.changelog_url.is_empty() {
            println!("changelog={}", manifest.changelog_url);
        }
    }
    if let Some(last_check) = status.last_check.as_ref() {
        println!("last_check_unix_millis={}", last_check.unix_millis);
    }
}

async fn connect(addr: &str) -> Result<Channel, Box<dyn std::error::Error>> {
    let endpoint = format!("http://{addr}");
    Ok(Channel::from_shared(endpoint)?.connect().await?)
}

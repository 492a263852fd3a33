mod cli;
mod logging;

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures_util::future::join_all;
use serde_json::{Value, json};

use cli::{Cli, Command};
use unifi_cloud_rtc::{CloudApi, CloudConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let config = cli.apply(CloudConfig::from_env());
    let span = tracing::info_span!("unifi_cloud", identity = %config.username);
    let api = CloudApi::new(config)
        .context("failed to build cloud client")?
        .with_span(span);

    let result = run(&api, cli.command).await;
    if let Err(err) = api.logout().await {
        tracing::warn!(error = %err, "logout failed");
    }
    result
}

async fn run(api: &CloudApi, command: Command) -> Result<()> {
    match command {
        Command::SelfInfo => print_json(&api.self_info().await.context("fetch account")?),
        Command::Devices => print_json(&api.devices().await.context("list devices")?),
        Command::DeleteDevice { device_id } => {
            api.delete_device(&device_id)
                .await
                .with_context(|| format!("delete device {device_id}"))?;
            println!("deleted {device_id}");
            Ok(())
        }
        Command::TurnCreds { device_id } => print_json(
            &api.turn_creds(&device_id)
                .await
                .with_context(|| format!("turn credentials for {device_id}"))?,
        ),
        Command::Connect { device_ids } => {
            let results =
                join_all(device_ids.iter().map(|id| api.open_webrtc_as_called(id))).await;
            let mut failed = 0;
            for result in results {
                match result {
                    Ok(outcome) => print_json(&json!({
                        "deviceId": outcome.device_id,
                        "webRtcId": outcome.web_rtc_id,
                        "address": outcome.selected.address,
                        "port": outcome.selected.port,
                        "acknowledgement": outcome.acknowledgement,
                    }))?,
                    Err(failure) => {
                        failed += 1;
                        eprintln!("{failure} [{:?}]", failure.kind());
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} negotiations failed", device_ids.len());
            }
            Ok(())
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

//! iored daemon entry point.

use log::{debug, error, info};
use tokio::signal;

use iored::{Command, Config, Egress, Iored};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting iored daemon with config: {:?}", cfg);

    let mut iored = Iored::start(cfg).await?;
    info!(
        "Host {} publishing on {}, answering on {}",
        iored.host().uuid,
        iored.pub_url(),
        iored.rep_url()
    );

    // Ask everybody on the group to announce themselves
    iored.send(Command::GetInfo).await?;

    loop {
        tokio::select! {
            egress = iored.recv() => match egress {
                Some(Egress::Packet(packet)) => {
                    debug!("Packet from {}::{} ({})", packet.device, packet.host.uuid, packet.numpacket);
                }
                Some(Egress::Stopped) | None => break,
                Some(other) => info!("{:?}", other),
            },
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down..."),
                    Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                }
                break;
            }
        }
    }

    iored.stop().await?;
    info!("Shutdown complete.");
    Ok(())
}

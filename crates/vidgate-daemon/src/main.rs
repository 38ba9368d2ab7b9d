use anyhow::Result;

use vidgate_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("vidgate-daemon")?;
    vidgate_daemon::server::run().await
}

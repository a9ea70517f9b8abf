use anyhow::Result;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::error::Error;
use crate::registry::FleetRegistry;

/// Ask one device to push fresh shards before a report is built. The
/// device answers a one-line `PUSH` command with a one-line ack.
pub async fn request_push(network_address: &str, timeout_secs: u64) -> Result<()> {
    let attempt = async {
        let mut stream = TcpStream::connect(network_address)
            .await
            .map_err(|e| Error::Upstream(format!("Connect to {}: {}", network_address, e)))?;

        stream
            .write_all(b"PUSH\n")
            .await
            .map_err(|e| Error::Upstream(format!("Write to {}: {}", network_address, e)))?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Upstream(format!("Read from {}: {}", network_address, e)))?;

        if line.trim() != "OK" {
            return Err(
                Error::Upstream(format!("Device at {} answered {:?}", network_address, line.trim()))
                    .into(),
            );
        }
        Ok::<(), anyhow::Error>(())
    };

    match timeout(Duration::from_secs(timeout_secs), attempt).await {
        Ok(result) => result,
        Err(_) => Err(Error::Upstream(format!(
            "Device pull to {} timed out after {}s",
            network_address, timeout_secs
        ))
        .into()),
    }
}

/// Sweep the fleet asking every device with a known network address to
/// push. Devices are contacted concurrently, so the whole sweep is bounded
/// by a single timeout rather than one per device. Failures are skipped,
/// never fatal: a report built afterwards is simply as fresh as the
/// devices that answered.
pub async fn pull_fleet(registry: &FleetRegistry, timeout_secs: u64) -> usize {
    let mut targets = Vec::new();
    for record in registry.list().await {
        match record.network_address {
            Some(addr) => targets.push((record.id, addr)),
            None => debug!("Device {} has no network address, skipping pull", record.id),
        }
    }

    let results = futures::future::join_all(targets.into_iter().map(|(id, addr)| async move {
        match request_push(&addr, timeout_secs).await {
            Ok(()) => {
                debug!("Device {} acknowledged push request", id);
                true
            }
            Err(e) => {
                warn!("Pull from device {} skipped: {}", id, e);
                false
            }
        }
    }))
    .await;

    let pulled = results.into_iter().filter(|answered| *answered).count();
    info!("Fleet pull complete: {} devices answered", pulled);
    pulled
}

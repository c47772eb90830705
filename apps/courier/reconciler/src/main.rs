//! Courier reconciler - entry point
//!
//! Drives SendRequests and SenderConfigs to their desired state.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    courier_reconciler::run().await
}

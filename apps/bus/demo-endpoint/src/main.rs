//! Demo Endpoint - Entry Point
//!
//! Runs a single in-memory endpoint through immediate retries, delayed
//! retries and error-queue forwarding.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    bus_demo_endpoint::run().await
}

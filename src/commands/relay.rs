use log::{debug, info};
use tokio::net::TcpListener;

use crate::error::Result;
use crate::relay_utils::serve;

/// Run the relay that both parties connect to.
///
/// Each connection is given a fresh 6-digit party id. The relay stores the public
/// key a party registers and forwards requests, answers and sealed envelopes
/// between parties by id. It never sees plaintext or private keys, and it forgets
/// a party (and its key) as soon as the connection drops.
pub async fn run(bind: &str, port: u16) -> Result<()> {
    let bind_addr = format!("{}:{}", bind, port);
    debug!("Attempting to bind to {}", bind_addr);

    let listener = TcpListener::bind(&bind_addr).await?;
    println!("Server listening on {}", listener.local_addr()?);
    info!("Relay server started on {}", bind_addr);

    serve(listener).await
}

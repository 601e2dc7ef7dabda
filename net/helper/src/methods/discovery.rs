//! `beginAdvertising`: joins the DHT, then merges local multicast finds and
//! DHT provider batches into one `discoveredPeer` upcall stream.

use std::sync::Arc;
use std::time::Duration;

use coda_p2p::{AddrInfo, Helper};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::app::App;
use crate::error::{bad_p2p, RpcError};

/// Deadline for dialing a discovered peer.
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Grace period before the first DHT lookup, letting our own advertisement
/// propagate.
const DHT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Pause between DHT provider sweeps.
const DHT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Serialize)]
struct DiscoveredPeerUpcall {
    peer_id: String,
    multiaddrs: Vec<String>,
    upcall: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct BeginAdvertisingMsg {}

impl BeginAdvertisingMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        let helper = app.helper()?;
        let local_finds = helper.begin_advertising().await.map_err(bad_p2p)?;

        spawn_local_task(app.clone(), helper.clone(), local_finds);
        spawn_dht_task(app.clone(), helper.clone());

        Ok(json!("beginAdvertising success"))
    }
}

/// Dials every multicast-discovered peer as it shows up.
fn spawn_local_task(app: Arc<App>, helper: Arc<Helper>, mut finds: mpsc::Receiver<AddrInfo>) {
    tokio::spawn(async move {
        while let Some(found) = finds.recv().await {
            dial_and_announce(&app, &helper, found, "local").await;
        }
    });
}

/// Periodically sweeps the DHT for rendezvous providers.
fn spawn_dht_task(app: Arc<App>, helper: Arc<Helper>) {
    tokio::spawn(async move {
        tokio::time::sleep(DHT_INITIAL_DELAY).await;
        loop {
            match helper.find_peers().await {
                Ok(batch) => {
                    for found in batch {
                        dial_and_announce(&app, &helper, found, "dht").await;
                    }
                }
                Err(err) => {
                    warn!(%err, "DHT peer sweep failed");
                }
            }
            tokio::time::sleep(DHT_SWEEP_INTERVAL).await;
        }
    });
}

async fn dial_and_announce(app: &Arc<App>, helper: &Arc<Helper>, found: AddrInfo, source: &str) {
    let dial = helper.dial_peer(found.peer_id, found.addrs.clone());
    match tokio::time::timeout(DIAL_TIMEOUT, dial).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(
                peer = %found.peer_id.to_base58(),
                source,
                %err,
                "couldn't connect to discovered peer (maybe the network ID mismatched?)"
            );
            return;
        }
        Err(_) => {
            warn!(peer = %found.peer_id.to_base58(), source, "dial to discovered peer timed out");
            return;
        }
    }
    info!(peer = %found.peer_id.to_base58(), source, "found a peer");
    helper
        .add_addresses(found.peer_id, found.addrs.clone())
        .await;

    // A DHT find may carry no addresses; report the live connection instead.
    let multiaddrs = if found.addrs.is_empty() {
        helper
            .connections_to_peer(found.peer_id)
            .await
            .map(|conns| {
                conns
                    .into_iter()
                    .map(|conn| conn.remote_addr.to_string())
                    .collect()
            })
            .unwrap_or_default()
    } else {
        found.addrs.iter().map(|addr| addr.to_string()).collect()
    };

    app.writer
        .must_write(&DiscoveredPeerUpcall {
            peer_id: found.peer_id.to_base58(),
            multiaddrs,
            upcall: "discoveredPeer",
        })
        .await;
}

//! `configure` and `generateKeypair`: the two methods that work before a
//! helper exists.

use std::path::PathBuf;
use std::sync::Arc;

use coda_p2p::{
    generate_keypair, marshal_private_key, marshal_public_key, unmarshal_private_key, Helper,
    HelperConfig, Multiaddr,
};
use libp2p::PeerId;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::App;
use crate::codec;
use crate::error::{bad_addr, bad_helper, bad_rpc, RpcError};
use crate::methods::spawn_validation_router;

#[derive(Debug, Deserialize)]
pub struct ConfigureMsg {
    pub statedir: PathBuf,
    pub privk: String,
    pub network_id: String,
    #[serde(rename = "ifaces")]
    pub listen_on: Vec<String>,
    #[serde(rename = "external_maddr")]
    pub external: String,
    pub unsafe_no_trust_ip: bool,
}

impl ConfigureMsg {
    pub async fn run(self, app: &Arc<App>) -> Result<Value, RpcError> {
        app.set_unsafe_no_trust_ip(self.unsafe_no_trust_ip);

        let privk_bytes = codec::decode(&self.privk).map_err(bad_rpc)?;
        let keypair = unmarshal_private_key(&privk_bytes).map_err(bad_rpc)?;

        let mut listen_on = Vec::with_capacity(self.listen_on.len());
        for addr in &self.listen_on {
            listen_on.push(addr.parse::<Multiaddr>().map_err(bad_rpc)?);
        }
        let external_addr = self.external.parse::<Multiaddr>().map_err(bad_addr)?;

        let helper = Helper::spawn(HelperConfig {
            state_dir: self.statedir,
            keypair,
            network_id: self.network_id,
            listen_on,
            external_addr,
            filters: Default::default(),
        })
        .map_err(bad_helper)?;

        if let Some(gossip) = helper.gossip_messages() {
            spawn_validation_router(app.clone(), helper.clone(), gossip);
        }
        app.set_helper(helper);

        Ok(json!("configure success"))
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateKeypairMsg {}

impl GenerateKeypairMsg {
    pub async fn run(self, _app: &Arc<App>) -> Result<Value, RpcError> {
        let keypair = generate_keypair();
        let sk = marshal_private_key(&keypair).map_err(bad_rpc)?;
        let pk = marshal_public_key(&keypair.public());
        let peer_id = PeerId::from(keypair.public());

        Ok(json!({
            "sk": codec::encode(&sk),
            "pk": codec::encode(&pk),
            "peer_id": peer_id.to_base58(),
        }))
    }
}

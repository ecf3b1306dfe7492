//! `wgmesh status` - print derived mesh parameters

use clap::Args;
use wgmesh_common::derive;

#[derive(Args)]
pub struct StatusArgs {
    /// Shared mesh secret
    #[arg(long, env = "WGMESH_SECRET")]
    pub secret: String,
}

pub fn execute(args: StatusArgs) -> anyhow::Result<()> {
    let keys = derive(&args.secret)?;
    println!("network id:      {}", hex::encode(keys.network_id));
    println!("mesh subnet:     {}", keys.mesh_subnet_cidr());
    println!("multicast group: {}", keys.multicast_group());
    println!("gossip port:     {}", keys.gossip_port);
    println!("rendezvous id:   {}", keys.rendezvous_hex());
    Ok(())
}

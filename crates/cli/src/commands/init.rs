//! `wgmesh init` - generate a fresh mesh secret

use base64::Engine;
use clap::Args;
use rand::RngCore;

#[derive(Args)]
pub struct InitArgs {
    /// Generate a mesh secret (the default and only artifact)
    #[arg(long)]
    pub secret: bool,
}

pub fn execute(_args: InitArgs) {
    println!("{}", generate_secret());
}

/// 32 random bytes, URL-safe base64 without padding.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

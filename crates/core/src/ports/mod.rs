mod chain_client;
mod signer_bridge;

pub use chain_client::*;
pub use signer_bridge::*;

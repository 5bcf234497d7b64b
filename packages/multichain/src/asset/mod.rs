pub mod observer;
pub mod rpc;

pub use observer::AssetObserver;
pub use rpc::{AssetDaemonClient, AssetWalletClient};

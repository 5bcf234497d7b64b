pub mod contracts;
pub mod observer;
pub mod sighash;

pub use observer::EvmObserver;

pub mod config;
pub mod context;
pub mod error;
pub mod gps;
pub mod hal;
pub mod handshake;
pub mod lifecycle;
pub mod mock;
pub mod net;
pub mod power;
pub mod queue;
pub mod service;
pub mod simulate;
pub mod storage;
pub mod sync;
pub mod types;

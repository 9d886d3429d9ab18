pub mod config;
pub mod controller;
pub mod daemon_client;
pub mod dns;
pub mod error;
pub mod events;
pub mod install_lock;
pub mod ipc;
pub mod logging;
pub mod params;
pub mod retry;
pub mod service;
pub mod settings;
pub mod shell;

pub use controller::{TunnelController, TunnelState};
pub use events::{ConnectionState, EventSink, StateInfo};
pub use params::ConnectionParameters;
pub use settings::Settings;

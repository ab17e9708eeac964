pub mod broadcaster;
pub mod codec;
pub mod config;
pub mod health;
pub mod id_types;
pub mod logging;
pub mod media_session;
pub mod media_setup;
pub mod metrics;
pub mod negotiation;
pub mod participant;
pub mod registry;
pub mod room;
pub mod signaling;

pub use media_setup::MediaSetup;

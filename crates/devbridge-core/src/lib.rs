//! Device runtime shared by every devbridge connector.
//!
//! - **[`DeviceBridge`]**: validated at construction, then
//!   [`start()`](DeviceBridge::start) spawns one actor per device, a
//!   sharded command worker pool, the inbound message loop, and the
//!   polling scheduler. [`BridgeHandle`] controls the running bridge.
//!
//! - **[`CapabilityProvider`]**: the only thing a connector implements.
//!   It reads device state and applies validated commands.
//!
//! - **[`DiscoveryPublisher`]**: turns capability models into retained
//!   dashboard discovery entries, one per platform.
//!
//! - **[`ParasiteExtension`]**: lets a local device supplement a device
//!   owned by another instance on a dedicated extension topic.

mod actor;
pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod model;
pub mod parasite;
pub mod provider;
pub mod store;
mod worker;

// ── Primary re-exports ──────────────────────────────────────────────
pub use bridge::{BridgeHandle, DeviceBridge};
pub use config::BridgeConfig;
pub use discovery::{DiscoveryConfig, DiscoveryEntry, DiscoveryPublisher, Platform};
pub use error::CoreError;
pub use model::{
    CapabilityModel, Command, CommandOutcome, CommandPhase, DeviceDescriptor, DeviceState,
    FieldKind, FieldSpec, FieldType,
};
pub use parasite::{ExtensionPayload, ParasiteExtension, ParasiteTarget, TargetStatus};
pub use provider::{CapabilityProvider, ProviderError};
pub use store::{DeviceRecord, DeviceStore};

// devbridge-broker: broker plumbing shared by every devbridge connector.
//
// - [`TopicScheme`] maps (instance, device, channel) to topic strings and back.
// - [`payload`] holds the JSON wire contract (commands, responses, state).
// - [`Broker`] is the seam the device runtime talks through; [`BrokerClient`]
//   implements it over MQTT, [`MemoryBroker`] in-process.
// - [`PendingTable`] correlates published commands with their responses.

pub mod broker;
pub mod client;
pub mod error;
pub mod memory;
pub mod payload;
pub mod pending;
pub mod topic;

pub use broker::{Broker, InboundMessage, LinkState, publish_json};
pub use client::{BrokerClient, BrokerConfig, ReconnectConfig};
pub use error::Error;
pub use memory::{MemoryBroker, Publication};
pub use payload::{
    Availability, CommandPayload, ErrorCode, ErrorObject, ResponsePayload, StatePayload,
};
pub use pending::PendingTable;
pub use rumqttc::QoS;
pub use topic::{DeviceId, ExtensionPath, InstanceId, TopicMatch, TopicScheme, topic_matches};

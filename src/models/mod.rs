//! Data models shared by every service: relays, events, junction rows,
//! content-addressed metadata and the typed service-state store.

pub mod canonical;
pub mod event;
pub mod event_relay;
pub mod metadata;
pub mod relay;
pub mod relay_metadata;
pub mod service_state;

pub use event::Event;
pub use event_relay::EventRelay;
pub use metadata::{Metadata, MetadataType};
pub use relay::{Network, Relay};
pub use relay_metadata::RelayMetadata;
pub use service_state::{ServiceName, ServiceState, StateType};

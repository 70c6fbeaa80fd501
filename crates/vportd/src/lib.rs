//! Virtual Port Registry Daemon
//!
//! Tracks every endpoint attached to a software switch datapath (physical
//! adapters, the host's internal adapter, VM NICs and tunnel endpoints) and
//! keeps three lookup indices and a per-vport connection state machine
//! consistent while the host switch fabric creates, connects, updates,
//! disconnects and destroys ports and NICs out of band.
//!
//! # Architecture
//!
//! ```text
//!  host switch fabric          forwarding path / control program
//!         │                                  │
//!         ▼  FabricEvent                     ▼  describe / find_by_*
//!  ┌──────────────────┐  write lock  ┌──────────────┐  read lock
//!  │ lifecycle (hv_*) │─────────────▶│  VportStore  │◀────────── query
//!  └──────────────────┘              └──────────────┘
//!         │  after unlock
//!         ▼
//!  EventNotifier / HostHooks
//! ```

pub mod activation;
pub mod config;
pub mod entry;
pub mod error;
pub mod events;
pub mod fabric;
pub mod identity;
pub mod lifecycle;
pub mod query;
pub mod registry;
pub mod store;

pub use activation::{ActivationGate, ActivationState};
pub use config::{NameLookup, RegistryConfig, DEFAULT_CONFIG_PATH};
pub use entry::{
    StatsDelta, TunnelContext, VportEntry, VportErrStats, VportKind, VportState, VportStats,
    VxlanContext, DP_PORT_NUMBER_INVALID, DP_PORT_NUMBER_LOCAL, EXTERNAL_VIRTUAL_ADAPTER_NAME,
    MAX_DP_PORTS,
};
pub use error::{ConversionError, Result, VportError};
pub use events::{ChannelNotifier, EventNotifier, NullNotifier, VportEvent, VportEvents};
pub use fabric::{
    FabricEvent, HostEnumeration, HostNicState, HostNicType, HostPortState, HostPortType,
    NicParams, PortParams,
};
pub use identity::{CountedString, HvIdentity, MacAddress, VportName};
pub use query::{status_of, QueryKey, VportRecord};
pub use registry::{HostHooks, NoopHooks, TunnelRequest, VportRegistry};
pub use store::{SingletonSlot, VportId, VportStore};

//! Host switch fabric parameter blocks
//!
//! The fabric owns these structures; the registry copies what it needs out of
//! them and never holds on to a reference.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::identity::{CountedString, HvIdentity, MacAddress};

/// Port type as reported by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPortType {
    /// Port bound to the physical adapter(s).
    External,
    /// Port bound to the host's virtual adapter.
    Internal,
    /// VM NIC using the synthetic (VMBus) device.
    Synthetic,
    /// VM NIC using the emulated legacy device.
    Emulated,
}

/// Port state as reported by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPortState {
    #[default]
    Created,
    Teardown,
    Deleted,
}

/// NIC type as reported by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostNicType {
    External,
    Internal,
    Synthetic,
    Emulated,
}

impl HostNicType {
    /// NICs that belong to a VM rather than to the host.
    pub fn is_vm_nic(&self) -> bool {
        matches!(self, Self::Synthetic | Self::Emulated)
    }
}

/// NIC state as reported by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostNicState {
    #[default]
    Unknown,
    Created,
    Connected,
    Disconnected,
    Deleted,
}

/// Parameters delivered with port create/teardown/delete notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortParams {
    pub port_id: u32,
    pub port_type: HostPortType,
    #[serde(default)]
    pub port_state: HostPortState,
    #[serde(default)]
    pub port_name: CountedString,
    #[serde(default)]
    pub friendly_name: CountedString,
    /// Validation ports are test ports created by the fabric and never registered.
    #[serde(default)]
    pub is_validation_port: bool,
}

impl PortParams {
    pub fn new(port_id: u32, port_type: HostPortType) -> Self {
        Self {
            port_id,
            port_type,
            port_state: HostPortState::Created,
            port_name: CountedString::default(),
            friendly_name: CountedString::default(),
            is_validation_port: false,
        }
    }

    pub fn identity(&self) -> HvIdentity {
        HvIdentity::port(self.port_id)
    }
}

/// Parameters delivered with NIC notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicParams {
    pub port_id: u32,
    #[serde(default)]
    pub nic_index: u32,
    pub nic_type: HostNicType,
    #[serde(default)]
    pub nic_state: HostNicState,
    #[serde(default)]
    pub permanent_mac: MacAddress,
    #[serde(default)]
    pub current_mac: MacAddress,
    #[serde(default)]
    pub vm_mac: MacAddress,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub numa_node: u16,
    #[serde(default)]
    pub nic_name: CountedString,
    #[serde(default)]
    pub vm_name: CountedString,
    #[serde(default)]
    pub net_cfg_instance_id: Uuid,
}

impl NicParams {
    pub fn new(port_id: u32, nic_index: u32, nic_type: HostNicType) -> Self {
        Self {
            port_id,
            nic_index,
            nic_type,
            nic_state: HostNicState::Created,
            permanent_mac: MacAddress::ZERO,
            current_mac: MacAddress::ZERO,
            vm_mac: MacAddress::ZERO,
            mtu: 1500,
            numa_node: 0,
            nic_name: CountedString::default(),
            vm_name: CountedString::default(),
            net_cfg_instance_id: Uuid::nil(),
        }
    }

    pub fn identity(&self) -> HvIdentity {
        HvIdentity::new(self.port_id, self.nic_index)
    }

    /// A physical adapter teamed behind the external port.
    pub fn is_physical_nic(&self) -> bool {
        self.nic_type == HostNicType::External && self.nic_index != 0
    }
}

/// One asynchronous notification from the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "params", rename_all = "snake_case")]
pub enum FabricEvent {
    PortCreate(PortParams),
    PortTeardown(PortParams),
    PortDelete(PortParams),
    NicCreate(NicParams),
    NicConnect(NicParams),
    NicUpdate(NicParams),
    NicDisconnect(NicParams),
    NicDelete(NicParams),
}

impl FabricEvent {
    pub fn identity(&self) -> HvIdentity {
        match self {
            Self::PortCreate(p) | Self::PortTeardown(p) | Self::PortDelete(p) => p.identity(),
            Self::NicCreate(n)
            | Self::NicConnect(n)
            | Self::NicUpdate(n)
            | Self::NicDisconnect(n)
            | Self::NicDelete(n) => n.identity(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PortCreate(_) => "port_create",
            Self::PortTeardown(_) => "port_teardown",
            Self::PortDelete(_) => "port_delete",
            Self::NicCreate(_) => "nic_create",
            Self::NicConnect(_) => "nic_connect",
            Self::NicUpdate(_) => "nic_update",
            Self::NicDisconnect(_) => "nic_disconnect",
            Self::NicDelete(_) => "nic_delete",
        }
    }
}

impl fmt::Display for FabricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.identity())
    }
}

/// Ports and NICs the fabric reports as already present when the switch
/// attaches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostEnumeration {
    #[serde(default)]
    pub ports: Vec<PortParams>,
    #[serde(default)]
    pub nics: Vec<NicParams>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_nic_detection() {
        assert!(NicParams::new(20, 1, HostNicType::External).is_physical_nic());
        assert!(!NicParams::new(20, 0, HostNicType::External).is_physical_nic());
        assert!(!NicParams::new(20, 1, HostNicType::Synthetic).is_physical_nic());
    }

    #[test]
    fn test_event_json_shape() {
        let json = r#"{
            "event": "nic_connect",
            "params": { "port_id": 5, "nic_index": 0, "nic_type": "synthetic",
                        "current_mac": [0, 21, 93, 1, 2, 3], "vm_name": "web-01" }
        }"#;
        let event: FabricEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.identity(), HvIdentity::port(5));
        assert_eq!(event.to_string(), "nic_connect (port 0x5 nic 0)");
        match event {
            FabricEvent::NicConnect(n) => {
                assert_eq!(n.current_mac.to_string(), "00:15:5d:01:02:03");
                assert_eq!(n.vm_name.to_string(), "web-01");
                assert_eq!(n.nic_state, HostNicState::Unknown);
            }
            other => panic!("unexpected event {other}"),
        }
    }

    #[test]
    fn test_enumeration_defaults() {
        let json = r#"{ "ports": [ { "port_id": 20, "port_type": "external" } ] }"#;
        let host: HostEnumeration = serde_json::from_str(json).unwrap();
        assert_eq!(host.ports.len(), 1);
        assert_eq!(host.ports[0].port_state, HostPortState::Created);
        assert!(!host.ports[0].is_validation_port);
        assert!(host.nics.is_empty());
    }
}

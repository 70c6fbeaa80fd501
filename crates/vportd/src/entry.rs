//! Vport entry and related types.
//!
//! A [`VportEntry`] is the record kept for one endpoint attached to the switch:
//! a physical adapter, the host's internal adapter, a VM NIC, or a tunnel.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::events::VportEvents;
use crate::fabric::{HostNicState, HostNicType, HostPortState, HostPortType, NicParams, PortParams};
use crate::identity::{CountedString, HvIdentity, MacAddress, VportName};

/// Largest port number the datapath hands out.
pub const MAX_DP_PORTS: u32 = u16::MAX as u32;

/// Port number of an entry that has not been admitted by the datapath.
pub const DP_PORT_NUMBER_INVALID: u32 = MAX_DP_PORTS;

/// Reserved LOCAL port; never bound to a vport on this platform.
pub const DP_PORT_NUMBER_LOCAL: u32 = 0;

/// Name given to the external port-level entry.
pub const EXTERNAL_VIRTUAL_ADAPTER_NAME: &str = "external.virtualAdapter";

/// Datapath vport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VportKind {
    /// Host's internal adapter.
    Internal,
    /// Physical adapter or the external port itself.
    NetdevExternal,
    /// VM NIC (synthetic or emulated).
    NetdevVirtual,
    TunnelVxlan,
    TunnelGre,
    TunnelGre64,
}

impl VportKind {
    pub fn from_port_type(port_type: HostPortType) -> Self {
        match port_type {
            HostPortType::External => Self::NetdevExternal,
            HostPortType::Internal => Self::Internal,
            HostPortType::Synthetic | HostPortType::Emulated => Self::NetdevVirtual,
        }
    }

    #[inline]
    pub fn is_tunnel(&self) -> bool {
        matches!(self, Self::TunnelVxlan | Self::TunnelGre | Self::TunnelGre64)
    }

    #[inline]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal)
    }

    /// Backed by a fabric NIC (physical or VM).
    #[inline]
    pub fn is_netdev(&self) -> bool {
        matches!(self, Self::NetdevExternal | Self::NetdevVirtual)
    }

    /// Numeric vport type reported to the control program.
    pub fn ovs_type(&self) -> u32 {
        match self {
            Self::NetdevExternal | Self::NetdevVirtual => 1,
            Self::Internal => 2,
            Self::TunnelGre => 3,
            Self::TunnelVxlan => 4,
            Self::TunnelGre64 => 104,
        }
    }
}

impl fmt::Display for VportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::NetdevExternal => write!(f, "netdev-external"),
            Self::NetdevVirtual => write!(f, "netdev-virtual"),
            Self::TunnelVxlan => write!(f, "vxlan"),
            Self::TunnelGre => write!(f, "gre"),
            Self::TunnelGre64 => write!(f, "gre64"),
        }
    }
}

impl std::str::FromStr for VportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "internal" => Ok(Self::Internal),
            "netdev-external" => Ok(Self::NetdevExternal),
            "netdev-virtual" | "netdev" => Ok(Self::NetdevVirtual),
            "vxlan" => Ok(Self::TunnelVxlan),
            "gre" => Ok(Self::TunnelGre),
            "gre64" => Ok(Self::TunnelGre64),
            _ => Err(format!("Unknown vport kind: {}", s)),
        }
    }
}

/// Vport state machine states.
///
/// `Unknown → PortCreated → NicCreated → Connected`; teardown and delete are
/// reachable from any state, and a disconnect moves `Connected` back to
/// `NicCreated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VportState {
    #[default]
    Unknown,
    PortCreated,
    NicCreated,
    Connected,
    PortTearDown,
    PortDeleted,
}

impl VportState {
    fn from_port_state(state: HostPortState) -> Self {
        match state {
            HostPortState::Created => Self::PortCreated,
            HostPortState::Teardown => Self::PortTearDown,
            HostPortState::Deleted => Self::PortDeleted,
        }
    }

    /// State after a NIC create, or `None` if the NIC state carries no
    /// information.
    fn from_nic_state(state: HostNicState) -> Option<Self> {
        match state {
            HostNicState::Created | HostNicState::Disconnected => Some(Self::NicCreated),
            HostNicState::Connected => Some(Self::Connected),
            HostNicState::Deleted => Some(Self::PortCreated),
            HostNicState::Unknown => None,
        }
    }

    /// A NIC is attached to the port.
    #[inline]
    pub fn has_nic(&self) -> bool {
        matches!(self, Self::NicCreated | Self::Connected)
    }
}

impl fmt::Display for VportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::PortCreated => write!(f, "PORT_CREATED"),
            Self::NicCreated => write!(f, "NIC_CREATED"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::PortTearDown => write!(f, "PORT_TEAR_DOWN"),
            Self::PortDeleted => write!(f, "PORT_DELETED"),
        }
    }
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VportStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Error counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VportErrStats {
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

/// Counter increments reported by the forwarding path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub stats: VportStats,
    pub err_stats: VportErrStats,
}

impl StatsDelta {
    pub fn rx(packets: u64, bytes: u64) -> Self {
        Self {
            stats: VportStats {
                rx_packets: packets,
                rx_bytes: bytes,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn tx(packets: u64, bytes: u64) -> Self {
        Self {
            stats: VportStats {
                tx_packets: packets,
                tx_bytes: bytes,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// VXLAN tunnel context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VxlanContext {
    /// Destination UDP port for encapsulated traffic.
    pub dst_port: u16,
}

impl VxlanContext {
    pub const DEFAULT_DST_PORT: u16 = 4789;
}

/// Kind-specific private state, owned by the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelContext {
    Vxlan(VxlanContext),
}

/// One vport.
#[derive(Debug, Clone)]
pub struct VportEntry {
    /// Datapath port number, [`DP_PORT_NUMBER_INVALID`] until admitted.
    pub port_no: u32,
    /// Fabric identity; `None` for tunnel vports.
    pub identity: Option<HvIdentity>,
    /// Datapath name, when one has been bound.
    pub name: Option<VportName>,
    pub kind: VportKind,
    pub state: VportState,
    pub is_external: bool,
    pub numa_node: u16,
    pub mtu: u32,

    pub permanent_mac: MacAddress,
    pub current_mac: MacAddress,
    pub vm_mac: MacAddress,

    // Host-supplied, copied verbatim
    pub host_port_type: Option<HostPortType>,
    pub port_state: HostPortState,
    pub nic_state: HostNicState,
    pub hv_port_name: CountedString,
    pub friendly_name: CountedString,
    pub nic_name: CountedString,
    pub vm_name: CountedString,
    pub net_cfg_instance_id: Uuid,

    pub stats: VportStats,
    pub err_stats: VportErrStats,

    /// Control channel receiving packet-miss upcalls.
    pub upcall_pid: u32,

    pub tunnel: Option<TunnelContext>,
}

impl VportEntry {
    fn blank(kind: VportKind) -> Self {
        Self {
            port_no: DP_PORT_NUMBER_INVALID,
            identity: None,
            name: None,
            kind,
            state: VportState::Unknown,
            is_external: false,
            numa_node: 0,
            mtu: 0,
            permanent_mac: MacAddress::ZERO,
            current_mac: MacAddress::ZERO,
            vm_mac: MacAddress::ZERO,
            host_port_type: None,
            port_state: HostPortState::Created,
            nic_state: HostNicState::Unknown,
            hv_port_name: CountedString::default(),
            friendly_name: CountedString::default(),
            nic_name: CountedString::default(),
            vm_name: CountedString::default(),
            net_cfg_instance_id: Uuid::nil(),
            stats: VportStats::default(),
            err_stats: VportErrStats::default(),
            upcall_pid: 0,
            tunnel: None,
        }
    }

    /// Entry for a port create notification.
    pub fn from_port_params(params: &PortParams) -> Self {
        let mut vport = Self::blank(VportKind::from_port_type(params.port_type));
        vport.identity = Some(params.identity());
        vport.host_port_type = Some(params.port_type);
        vport.port_state = params.port_state;
        vport.is_external = params.port_type == HostPortType::External;
        vport.hv_port_name = params.port_name.clone();
        vport.friendly_name = params.friendly_name.clone();
        vport.state = VportState::from_port_state(params.port_state);
        vport
    }

    /// Sub-entry for a physical NIC teamed behind the external port.
    pub fn physical_nic(external: &VportEntry, nic_index: u32) -> Self {
        let port_id = external.port_id();
        let mut vport = Self::blank(VportKind::NetdevExternal);
        vport.identity = Some(HvIdentity::new(port_id, nic_index));
        vport.host_port_type = external.host_port_type;
        vport.port_state = external.port_state;
        vport.is_external = true;
        vport.hv_port_name = external.hv_port_name.clone();
        vport.friendly_name = external.friendly_name.clone();
        vport.state = VportState::PortCreated;
        vport
    }

    /// Tunnel endpoint created by the datapath.
    pub fn tunnel(kind: VportKind, name: VportName, tunnel: Option<TunnelContext>) -> Self {
        debug_assert!(kind.is_tunnel());
        let mut vport = Self::blank(kind);
        vport.name = Some(name);
        vport.state = VportState::PortCreated;
        vport.tunnel = tunnel;
        vport
    }

    pub fn port_id(&self) -> u32 {
        self.identity.map(|id| id.port_id).unwrap_or(0)
    }

    pub fn nic_index(&self) -> u32 {
        self.identity.map(|id| id.nic_index).unwrap_or(0)
    }

    pub fn has_port_no(&self) -> bool {
        self.port_no != DP_PORT_NUMBER_INVALID
    }

    /// The external port-level entry (singleton slot).
    pub fn is_external_port(&self) -> bool {
        self.is_external && self.nic_index() == 0
    }

    /// A physical adapter sub-entry of the external port.
    pub fn is_physical_nic(&self) -> bool {
        self.is_external && self.nic_index() != 0
    }

    /// Copy NIC create parameters into the entry and derive the new state.
    pub fn apply_nic_params(&mut self, nic: &NicParams) {
        debug_assert_eq!(self.port_id(), nic.port_id);

        self.permanent_mac = nic.permanent_mac;
        self.current_mac = nic.current_mac;
        if nic.nic_type.is_vm_nic() {
            self.vm_mac = nic.vm_mac;
            self.vm_name = nic.vm_name.clone();
        } else {
            self.net_cfg_instance_id = nic.net_cfg_instance_id;
        }
        self.nic_name = nic.nic_name.clone();
        self.mtu = nic.mtu;
        self.nic_state = nic.nic_state;
        self.numa_node = nic.numa_node;
        if let Some(state) = VportState::from_nic_state(nic.nic_state) {
            self.state = state;
        }
    }

    /// Apply a NIC update and report which observable fields changed.
    pub fn apply_nic_update(&mut self, nic: &NicParams) -> VportEvents {
        let mut events = VportEvents::empty();

        match nic.nic_type {
            HostNicType::External | HostNicType::Internal => {
                self.net_cfg_instance_id = nic.net_cfg_instance_id;
            }
            HostNicType::Synthetic | HostNicType::Emulated => {
                if self.vm_mac != nic.vm_mac {
                    self.vm_mac = nic.vm_mac;
                    events |= VportEvents::MAC_CHANGE;
                }
            }
        }
        if self.permanent_mac != nic.permanent_mac {
            self.permanent_mac = nic.permanent_mac;
            events |= VportEvents::MAC_CHANGE;
        }
        if self.current_mac != nic.current_mac {
            self.current_mac = nic.current_mac;
            events |= VportEvents::MAC_CHANGE;
        }
        if self.mtu != nic.mtu {
            self.mtu = nic.mtu;
            events |= VportEvents::MTU_CHANGE;
        }
        self.numa_node = nic.numa_node;
        events
    }

    /// Add counter increments; counters never go backwards.
    pub fn record_stats(&mut self, delta: &StatsDelta) {
        let s = &mut self.stats;
        s.rx_packets = s.rx_packets.saturating_add(delta.stats.rx_packets);
        s.tx_packets = s.tx_packets.saturating_add(delta.stats.tx_packets);
        s.rx_bytes = s.rx_bytes.saturating_add(delta.stats.rx_bytes);
        s.tx_bytes = s.tx_bytes.saturating_add(delta.stats.tx_bytes);

        let e = &mut self.err_stats;
        e.rx_errors = e.rx_errors.saturating_add(delta.err_stats.rx_errors);
        e.tx_errors = e.tx_errors.saturating_add(delta.err_stats.tx_errors);
        e.rx_dropped = e.rx_dropped.saturating_add(delta.err_stats.rx_dropped);
        e.tx_dropped = e.tx_dropped.saturating_add(delta.err_stats.tx_dropped);
    }
}

//! Read-side lookups and the query record projection
//!
//! Every lookup takes the registry lock in shared mode only. Callers either
//! get an owned snapshot or run a closure against the entry while the shared
//! lock is held; references never escape the lock.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{info, instrument, warn};

use crate::config::NameLookup;
use crate::entry::{VportEntry, VportKind, VportState, DP_PORT_NUMBER_LOCAL};
use crate::error::{Result, VportError};
use crate::events::VportEvents;
use crate::identity::{
    CountedString, HvIdentity, MacAddress, VportName, MAX_PORT_NAME_LEN, MAX_VIF_UUID_LEN,
    MAX_VM_UUID_LEN,
};
use crate::registry::VportRegistry;
use crate::store::{VportId, VportStore};

/// Key of a control-plane query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKey {
    PortNo(u32),
    Name(String),
}

impl FromStr for QueryKey {
    type Err = std::convert::Infallible;

    /// Decimal numbers select a port number; anything else is a name.
    /// The local port number is never bound, so "0" is taken as a name.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.parse::<u32>() {
            Ok(port_no) if port_no != DP_PORT_NUMBER_LOCAL => Self::PortNo(port_no),
            _ => Self::Name(s.to_string()),
        })
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortNo(port_no) => write!(f, "port {}", port_no),
            Self::Name(name) => write!(f, "name {}", name),
        }
    }
}

/// Flattened vport description returned to the control-plane query path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VportRecord {
    pub dp_no: u32,
    pub port_no: u32,
    pub mac: MacAddress,
    pub perm_mac: MacAddress,
    pub vm_mac: MacAddress,
    pub nic_index: u32,
    pub port_id: u32,
    pub kind: VportKind,
    /// Numeric vport type as the control program knows it.
    #[serde(rename = "type")]
    pub ovs_type: u32,
    pub mtu: u32,
    pub status: VportEvents,
    pub vm_uuid: String,
    pub vif_uuid: String,
    pub name: String,
}

impl VportRecord {
    /// Link is up.
    pub fn is_up(&self) -> bool {
        self.status.contains(VportEvents::LINK_UP)
    }
}

/// Connect/link status mask for a vport state.
pub fn status_of(state: VportState) -> VportEvents {
    match state {
        VportState::NicCreated => VportEvents::CONNECT | VportEvents::LINK_DOWN,
        VportState::Connected => VportEvents::CONNECT | VportEvents::LINK_UP,
        _ => VportEvents::DISCONNECT,
    }
}

/// Fields copied under the shared lock. String fields are shared buffers,
/// so taking the snapshot does not allocate.
struct Snapshot {
    record: VportRecord,
    name: Option<VportName>,
    friendly_name: CountedString,
    vm_name: CountedString,
    nic_name: CountedString,
    convert_ids: bool,
}

impl VportRegistry {
    pub fn find_by_port_no(&self, port_no: u32) -> Option<VportEntry> {
        let store = self.read();
        store.find_by_port_no(port_no).and_then(|id| store.get(id)).cloned()
    }

    pub fn find_by_identity(&self, port_id: u32, nic_index: u32) -> Option<VportEntry> {
        let store = self.read();
        store
            .find_by_identity(port_id, nic_index)
            .and_then(|id| store.get(id))
            .cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<VportEntry> {
        let name = VportName::new(name).ok()?;
        let store = self.read();
        store.find_by_name(&name).and_then(|id| store.get(id)).cloned()
    }

    /// Scan for a vport by its fabric friendly name.
    pub fn find_by_hv_name(&self, name: &str) -> Option<VportEntry> {
        let store = self.read();
        store
            .find_by_hv_name(name.as_bytes())
            .and_then(|id| store.get(id))
            .cloned()
    }

    /// Run `f` against the entry bound to `port_no` while the shared lock is
    /// held.
    pub fn with_port_no<R>(&self, port_no: u32, f: impl FnOnce(&VportEntry) -> R) -> Option<R> {
        let store = self.read();
        store.find_by_port_no(port_no).and_then(|id| store.get(id)).map(f)
    }

    /// Owned snapshots of every entry, ordered by port number then identity.
    pub fn list_ports(&self) -> Vec<VportEntry> {
        let mut ports: Vec<VportEntry> = {
            let store = self.read();
            store.iter().map(|(_, vport)| vport.clone()).collect()
        };
        ports.sort_by_key(|v| (v.port_no, v.identity.unwrap_or(HvIdentity::port(0))));
        ports
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Physical adapters teamed behind the external port.
    pub fn num_physical_nics(&self) -> usize {
        self.read().num_physical_nics()
    }

    /// Describe one vport for the control-plane query path.
    ///
    /// Entries being torn down or deleted report not found. Secondary string
    /// fields are converted after the lock is released and degrade to empty
    /// text on failure.
    #[instrument(skip(self), fields(key = %key))]
    pub fn describe(&self, key: &QueryKey) -> Result<VportRecord> {
        let snapshot = {
            let store = self.read();
            let id = self.resolve(&store, key);
            id.and_then(|id| store.get(id))
                .filter(|v| is_describable(v))
                .map(|vport| self.snapshot(vport))
        };
        match snapshot {
            Some(snapshot) => Ok(self.finish(snapshot)),
            None => {
                warn!("Vport does not exist any more");
                Err(VportError::NotFound(key.to_string()))
            }
        }
    }

    fn resolve(&self, store: &VportStore, key: &QueryKey) -> Option<VportId> {
        match key {
            QueryKey::PortNo(port_no) => store.find_by_port_no(*port_no),
            QueryKey::Name(name) => match self.config().name_lookup {
                NameLookup::OvsName => {
                    let name = VportName::new(name).ok()?;
                    store.find_by_name(&name)
                }
                NameLookup::HypervisorName => store.find_by_hv_name(name.as_bytes()),
            },
        }
    }

    fn snapshot(&self, vport: &VportEntry) -> Snapshot {
        let record = VportRecord {
            dp_no: self.config().datapath_no,
            port_no: vport.port_no,
            mac: vport.current_mac,
            perm_mac: vport.permanent_mac,
            vm_mac: if vport.kind.is_netdev() {
                vport.vm_mac
            } else {
                MacAddress::ZERO
            },
            nic_index: vport.nic_index(),
            port_id: vport.port_id(),
            kind: vport.kind,
            ovs_type: vport.kind.ovs_type(),
            mtu: vport.mtu,
            status: status_of(vport.state),
            vm_uuid: String::new(),
            vif_uuid: String::new(),
            name: String::new(),
        };
        Snapshot {
            record,
            name: vport.name,
            friendly_name: vport.friendly_name.clone(),
            vm_name: vport.vm_name.clone(),
            nic_name: vport.nic_name.clone(),
            convert_ids: vport.kind.is_netdev() && vport.state.has_nic(),
        }
    }

    fn finish(&self, snapshot: Snapshot) -> VportRecord {
        let Snapshot {
            mut record,
            name,
            friendly_name,
            vm_name,
            nic_name,
            convert_ids,
        } = snapshot;

        record.name = match self.config().name_lookup {
            NameLookup::OvsName => name.map(|n| n.to_string_lossy()).unwrap_or_default(),
            NameLookup::HypervisorName => convert(&friendly_name, MAX_PORT_NAME_LEN, "port name"),
        };
        if convert_ids {
            record.vm_uuid = convert(&vm_name, MAX_VM_UUID_LEN, "VM name");
            record.vif_uuid = convert(&nic_name, MAX_VIF_UUID_LEN, "NIC name");
        }
        record
    }
}

fn is_describable(vport: &VportEntry) -> bool {
    !matches!(
        vport.state,
        VportState::Unknown | VportState::PortTearDown | VportState::PortDeleted
    )
}

fn convert(source: &CountedString, max: usize, field: &str) -> String {
    source.to_bounded(max).unwrap_or_else(|e| {
        info!(field, error = %e, "Failed to convert string, reporting empty");
        String::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::events::NullNotifier;
    use crate::fabric::{HostNicState, HostNicType, HostPortType, NicParams, PortParams};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn registry(name_lookup: NameLookup) -> VportRegistry {
        let config = RegistryConfig {
            datapath_no: 2,
            name_lookup,
            ..Default::default()
        };
        let registry = VportRegistry::with_notifier(config, Arc::new(NullNotifier)).unwrap();
        registry.activate();
        registry
    }

    fn vm_port(registry: &VportRegistry, port_id: u32, port_no: u32, name: &str) -> NicParams {
        let mut port = PortParams::new(port_id, HostPortType::Synthetic);
        port.friendly_name = "Network Adapter".try_into().unwrap();
        registry.hv_create_port(&port).unwrap();
        registry
            .bind_port(HvIdentity::port(port_id), port_no, Some(name), 0)
            .unwrap();

        let mut nic = NicParams::new(port_id, 0, HostNicType::Synthetic);
        nic.nic_state = HostNicState::Connected;
        nic.current_mac = MacAddress([0, 0x15, 0x5d, 0, 0, 1]);
        nic.vm_mac = MacAddress([0, 0x15, 0x5d, 0, 0, 2]);
        nic.vm_name = "4a1c2f3e-vm".try_into().unwrap();
        nic.nic_name = "4a1c2f3e-nic".try_into().unwrap();
        nic
    }

    #[test]
    fn test_query_key_parse() {
        assert_eq!("7".parse::<QueryKey>().unwrap(), QueryKey::PortNo(7));
        assert_eq!(
            "vif7".parse::<QueryKey>().unwrap(),
            QueryKey::Name("vif7".to_string())
        );
    }

    #[test]
    fn test_local_port_number_parses_as_name() {
        assert_eq!("0".parse::<QueryKey>().unwrap(), QueryKey::Name("0".to_string()));

        let registry = registry(NameLookup::OvsName);
        vm_port(&registry, 5, 3, "0");
        let record = registry.describe(&"0".parse().unwrap()).unwrap();
        assert_eq!(record.port_no, 3);
        assert_eq!(record.name, "0");
    }

    #[test]
    fn test_describe_connected_vm_nic() {
        let registry = registry(NameLookup::OvsName);
        let nic = vm_port(&registry, 5, 3, "vif3");
        registry.hv_create_nic(&nic).unwrap();

        let record = registry.describe(&QueryKey::PortNo(3)).unwrap();
        assert_eq!(record.dp_no, 2);
        assert_eq!(record.name, "vif3");
        assert_eq!(record.ovs_type, 1);
        assert_eq!(record.status, VportEvents::CONNECT | VportEvents::LINK_UP);
        assert!(record.is_up());
        assert_eq!(record.vm_uuid, "4a1c2f3e-vm");
        assert_eq!(record.vif_uuid, "4a1c2f3e-nic");
        assert_eq!(record.vm_mac, MacAddress([0, 0x15, 0x5d, 0, 0, 2]));
        assert_eq!(registry.describe(&QueryKey::Name("vif3".into())).unwrap(), record);
    }

    #[test]
    fn test_describe_without_nic_reports_disconnect() {
        let registry = registry(NameLookup::OvsName);
        vm_port(&registry, 5, 3, "vif3");

        let record = registry.describe(&QueryKey::Name("vif3".into())).unwrap();
        assert_eq!(record.status, VportEvents::DISCONNECT);
        assert!(!record.is_up());
        assert_eq!(record.vm_uuid, "");
    }

    #[test]
    fn test_describe_torn_down_is_not_found() {
        let registry = registry(NameLookup::OvsName);
        vm_port(&registry, 5, 3, "vif3");
        registry
            .hv_teardown_port(&PortParams::new(5, HostPortType::Synthetic))
            .unwrap();
        assert!(matches!(
            registry.describe(&QueryKey::PortNo(3)),
            Err(VportError::NotFound(_))
        ));
    }

    #[test]
    fn test_describe_conversion_failure_degrades() {
        let registry = registry(NameLookup::OvsName);
        let mut nic = vm_port(&registry, 5, 3, "vif3");
        nic.vm_name = CountedString::from_units(&[0x0061, 0xdc00]).unwrap();
        nic.nic_name = "n".repeat(MAX_VIF_UUID_LEN).as_str().try_into().unwrap();
        registry.hv_create_nic(&nic).unwrap();

        let record = registry.describe(&QueryKey::PortNo(3)).unwrap();
        assert_eq!(record.vm_uuid, "");
        assert_eq!(record.vif_uuid, "");
        assert_eq!(record.mac, MacAddress([0, 0x15, 0x5d, 0, 0, 1]));
    }

    #[test]
    fn test_describe_by_hypervisor_name() {
        let registry = registry(NameLookup::HypervisorName);
        vm_port(&registry, 5, 3, "vif3");

        let record = registry
            .describe(&QueryKey::Name("Network Adapter".into()))
            .unwrap();
        assert_eq!(record.name, "Network Adapter");
        assert!(registry.describe(&QueryKey::Name("vif3".into())).is_err());
    }

    #[test]
    fn test_list_ports_sorted() {
        let registry = registry(NameLookup::OvsName);
        vm_port(&registry, 6, 4, "vif4");
        vm_port(&registry, 5, 3, "vif3");
        let ports: Vec<u32> = registry.list_ports().iter().map(|v| v.port_no).collect();
        assert_eq!(ports, vec![3, 4]);
    }

    #[test]
    fn test_with_port_no_borrows_under_lock() {
        let registry = registry(NameLookup::OvsName);
        vm_port(&registry, 5, 3, "vif3");
        assert_eq!(registry.with_port_no(3, |v| v.port_id()), Some(5));
        assert_eq!(registry.with_port_no(4, |v| v.port_id()), None);
    }
}

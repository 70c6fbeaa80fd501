//! Integration tests for the vport registry
//!
//! Drives the registry the way the host fabric and the datapath do:
//! - Bootstrap from a host enumeration and activation
//! - Port and NIC notification sequences
//! - Event posting after the lock is released
//! - Concurrent notifications and queries

use ovs_vportd::{
    ChannelNotifier, EventNotifier, FabricEvent, HostHooks, HostNicState, HostNicType,
    HostPortType, HvIdentity, MacAddress, NicParams, PortParams, QueryKey, RegistryConfig,
    TunnelContext, TunnelRequest, VportError, VportEvents, VportKind, VportRegistry, VportState,
    DP_PORT_NUMBER_INVALID,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Notifier that records every posted event
#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<(u32, VportEvents)>>,
}

impl RecordingNotifier {
    fn take(&self) -> Vec<(u32, VportEvents)> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventNotifier for RecordingNotifier {
    fn post_event(&self, port_no: u32, events: VportEvents) {
        self.events.lock().push((port_no, events));
    }
}

/// Host hooks that record every call
#[derive(Default)]
struct RecordingHooks {
    calls: Mutex<Vec<String>>,
}

impl HostHooks for RecordingHooks {
    fn internal_adapter_up(&self, port_no: u32, guid: Uuid) {
        self.calls.lock().push(format!("up {} {}", port_no, guid));
    }

    fn internal_adapter_down(&self) {
        self.calls.lock().push("down".to_string());
    }

    fn release_tunnel(&self, port_no: u32, _tunnel: &TunnelContext) {
        self.calls.lock().push(format!("release {}", port_no));
    }
}

/// Test fixture: activated registry with recording collaborators
struct TestSetup {
    registry: Arc<VportRegistry>,
    notifier: Arc<RecordingNotifier>,
    hooks: Arc<RecordingHooks>,
}

impl TestSetup {
    fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    fn with_config(config: RegistryConfig) -> Self {
        let notifier = Arc::new(RecordingNotifier::default());
        let hooks = Arc::new(RecordingHooks::default());
        let registry = Arc::new(
            VportRegistry::new(config, notifier.clone(), hooks.clone())
                .expect("valid configuration"),
        );
        registry.activate();
        Self {
            registry,
            notifier,
            hooks,
        }
    }

    fn create_port(&self, port_id: u32, port_type: HostPortType) {
        self.registry
            .hv_create_port(&PortParams::new(port_id, port_type))
            .expect("port create");
    }

    fn bind(&self, port_id: u32, nic_index: u32, port_no: u32, name: &str) {
        self.registry
            .bind_port(HvIdentity::new(port_id, nic_index), port_no, Some(name), 0)
            .expect("bind port");
    }

    fn state(&self, port_id: u32, nic_index: u32) -> Option<VportState> {
        self.registry
            .find_by_identity(port_id, nic_index)
            .map(|v| v.state)
    }
}

fn vm_nic(port_id: u32, state: HostNicState) -> NicParams {
    let mut nic = NicParams::new(port_id, 0, HostNicType::Synthetic);
    nic.nic_state = state;
    nic.current_mac = MacAddress([0x00, 0x15, 0x5d, 0x00, 0x00, port_id as u8]);
    nic.vm_mac = nic.current_mac;
    nic.vm_name = "b5f7c9a0-1d2e-4f60-8a71-92b3c4d5e6f7".try_into().unwrap();
    nic.nic_name = "Microsoft:B5F7C9A0--1".try_into().unwrap();
    nic
}

#[test]
fn test_internal_port_connect_on_create() {
    let setup = TestSetup::new();
    setup.create_port(10, HostPortType::Internal);
    assert_eq!(setup.state(10, 0), Some(VportState::PortCreated));
    setup.bind(10, 0, 2, "br-int");

    let mut nic = NicParams::new(10, 0, HostNicType::Internal);
    nic.nic_state = HostNicState::Connected;
    setup.registry.hv_create_nic(&nic).unwrap();

    assert_eq!(setup.state(10, 0), Some(VportState::Connected));
    assert_eq!(
        setup.notifier.take(),
        vec![(2, VportEvents::CONNECT | VportEvents::LINK_UP)]
    );
    let vport = setup.registry.find_by_port_no(2).unwrap();
    assert_eq!(vport.kind, VportKind::Internal);
    assert_eq!(vport.port_id(), 10);
}

#[test]
fn test_external_port_with_physical_nic() {
    let setup = TestSetup::new();
    setup.create_port(20, HostPortType::External);
    {
        let ext = setup.registry.find_by_identity(20, 0).unwrap();
        assert!(ext.is_external_port());
        assert_eq!(ext.name.unwrap().to_string(), "external.virtualAdapter");
    }

    let nic = NicParams::new(20, 1, HostNicType::External);
    setup.registry.hv_create_nic(&nic).unwrap();
    assert_eq!(setup.registry.num_physical_nics(), 1);
    let sub = setup.registry.find_by_identity(20, 1).unwrap();
    assert_eq!(sub.name.unwrap().to_string(), "external.1");
    assert_eq!(sub.state, VportState::NicCreated);

    // The external port cannot go while the adapter is attached
    let delete = FabricEvent::PortDelete(PortParams::new(20, HostPortType::External));
    let err = setup.registry.dispatch(&delete).unwrap_err();
    assert!(err.is_contract_violation());
    assert!(setup.registry.find_by_identity(20, 0).is_some());

    setup.registry.hv_delete_nic(&nic).unwrap();
    assert_eq!(setup.registry.num_physical_nics(), 0);
    assert!(setup.registry.find_by_identity(20, 1).is_none());

    setup.registry.dispatch(&delete).unwrap();
    assert!(setup.registry.is_empty());
    setup.registry.validate().unwrap();
}

#[test]
fn test_query_by_name_before_and_after_create() {
    let setup = TestSetup::new();
    let key = QueryKey::Name("vif7".to_string());
    assert!(matches!(
        setup.registry.describe(&key),
        Err(VportError::NotFound(_))
    ));

    setup.create_port(7, HostPortType::Synthetic);
    setup.bind(7, 0, 7, "vif7");
    let record = setup.registry.describe(&key).unwrap();
    assert_eq!(record.name, "vif7");
    assert_eq!(record.port_no, 7);
    assert_eq!(record.port_id, 7);
}

#[test]
fn test_duplicate_create_leaves_entry_untouched() {
    let setup = TestSetup::new();
    setup.create_port(5, HostPortType::Synthetic);
    setup
        .registry
        .hv_create_nic(&vm_nic(5, HostNicState::Connected))
        .unwrap();
    let before = setup.registry.find_by_identity(5, 0).unwrap();

    let err = setup
        .registry
        .hv_create_port(&PortParams::new(5, HostPortType::Emulated))
        .unwrap_err();
    assert!(matches!(err, VportError::DuplicateIdentity(id) if id == HvIdentity::port(5)));

    let after = setup.registry.find_by_identity(5, 0).unwrap();
    assert_eq!(after.current_mac, before.current_mac);
    assert_eq!(after.state, VportState::Connected);
    assert_eq!(after.kind, VportKind::NetdevVirtual);
}

#[test]
fn test_unknown_identity_is_ignored() {
    let setup = TestSetup::new();
    for event in [
        FabricEvent::PortTeardown(PortParams::new(99, HostPortType::Synthetic)),
        FabricEvent::PortDelete(PortParams::new(99, HostPortType::Synthetic)),
        FabricEvent::NicConnect(vm_nic(99, HostNicState::Connected)),
        FabricEvent::NicUpdate(vm_nic(99, HostNicState::Connected)),
        FabricEvent::NicDisconnect(vm_nic(99, HostNicState::Disconnected)),
        FabricEvent::NicDelete(vm_nic(99, HostNicState::Deleted)),
    ] {
        setup.registry.dispatch(&event).unwrap();
    }
    assert!(setup.registry.is_empty());
    assert!(setup.notifier.take().is_empty());
}

#[test]
fn test_full_vm_nic_lifecycle_events() {
    let setup = TestSetup::new();
    setup.create_port(5, HostPortType::Synthetic);
    setup.bind(5, 0, 3, "vif3");

    let mut nic = vm_nic(5, HostNicState::Created);
    let steps: Vec<(FabricEvent, VportState, VportEvents)> = vec![
        (
            FabricEvent::NicCreate(nic.clone()),
            VportState::NicCreated,
            VportEvents::CONNECT,
        ),
        (
            FabricEvent::NicConnect(nic.clone()),
            VportState::Connected,
            VportEvents::LINK_UP,
        ),
        (
            FabricEvent::NicDisconnect(nic.clone()),
            VportState::NicCreated,
            VportEvents::LINK_DOWN,
        ),
        (
            FabricEvent::NicConnect(nic.clone()),
            VportState::Connected,
            VportEvents::LINK_UP,
        ),
        (
            FabricEvent::NicDelete(nic.clone()),
            VportState::PortCreated,
            VportEvents::DISCONNECT,
        ),
    ];
    for (event, state, events) in steps {
        setup.registry.dispatch(&event).unwrap();
        assert_eq!(setup.state(5, 0), Some(state), "after {}", event);
        assert_eq!(setup.notifier.take(), vec![(3, events)], "after {}", event);
    }

    nic.nic_state = HostNicState::Created;
    setup.registry.hv_create_nic(&nic).unwrap();
    setup.notifier.take();

    nic.mtu = 9000;
    nic.vm_mac = MacAddress([0x02, 0, 0, 0, 0, 1]);
    setup.registry.hv_update_nic(&nic).unwrap();
    assert_eq!(
        setup.notifier.take(),
        vec![(3, VportEvents::MAC_CHANGE | VportEvents::MTU_CHANGE)]
    );
    setup.registry.hv_update_nic(&nic).unwrap();
    assert!(setup.notifier.take().is_empty());

    setup
        .registry
        .hv_teardown_port(&PortParams::new(5, HostPortType::Synthetic))
        .unwrap();
    assert_eq!(setup.state(5, 0), Some(VportState::PortTearDown));
    assert!(setup.registry.describe(&QueryKey::PortNo(3)).is_err());
    setup
        .registry
        .hv_delete_port(&PortParams::new(5, HostPortType::Synthetic))
        .unwrap();
    assert!(setup.registry.find_by_port_no(3).is_none());
    setup.registry.validate().unwrap();
}

#[test]
fn test_internal_adapter_hooks() {
    let setup = TestSetup::new();
    setup.create_port(10, HostPortType::Internal);
    setup.bind(10, 0, 2, "br-int");

    let mut nic = NicParams::new(10, 0, HostNicType::Internal);
    nic.net_cfg_instance_id = Uuid::from_u128(0xfeed);
    setup.registry.hv_create_nic(&nic).unwrap();
    setup.registry.hv_connect_nic(&nic).unwrap();
    setup.registry.hv_disconnect_nic(&nic).unwrap();
    setup
        .registry
        .hv_delete_port(&PortParams::new(10, HostPortType::Internal))
        .unwrap();

    assert_eq!(
        *setup.hooks.calls.lock(),
        vec![
            format!("up 2 {}", Uuid::from_u128(0xfeed)),
            "down".to_string(),
            "down".to_string(),
        ]
    );
}

#[test]
fn test_bootstrap_and_clear() {
    let notifier = Arc::new(RecordingNotifier::default());
    let hooks = Arc::new(RecordingHooks::default());
    let registry =
        VportRegistry::new(RegistryConfig::default(), notifier.clone(), hooks.clone()).unwrap();

    let mut validation = PortParams::new(30, HostPortType::Synthetic);
    validation.is_validation_port = true;
    let ports = vec![
        PortParams::new(20, HostPortType::External),
        PortParams::new(10, HostPortType::Internal),
        PortParams::new(5, HostPortType::Synthetic),
        validation,
    ];
    assert_eq!(registry.add_configured_ports(&ports).unwrap(), 3);

    let nics = vec![
        NicParams::new(20, 1, HostNicType::External),
        NicParams::new(20, 2, HostNicType::External),
        NicParams::new(10, 0, HostNicType::Internal),
        vm_nic(5, HostNicState::Connected),
    ];
    assert_eq!(registry.init_configured_nics(&nics), 4);
    assert!(registry.activate());

    assert_eq!(registry.num_physical_nics(), 2);
    assert_eq!(registry.len(), 5);
    assert!(notifier.take().is_empty());
    assert_eq!(
        *hooks.calls.lock(),
        vec![format!("up {} {}", DP_PORT_NUMBER_INVALID, Uuid::nil())]
    );

    registry
        .add_tunnel_vport(&TunnelRequest::vxlan("vxlan_sys_4789", 9))
        .unwrap();
    registry.clear_all();
    assert!(registry.is_empty());
    assert_eq!(registry.num_physical_nics(), 0);
    assert!(hooks.calls.lock().contains(&"release 9".to_string()));
    registry.validate().unwrap();
}

#[test]
fn test_nic_create_waits_for_activation() {
    let config = RegistryConfig {
        activation_timeout_ms: 10_000,
        ..Default::default()
    };
    let notifier = Arc::new(RecordingNotifier::default());
    let registry = Arc::new(VportRegistry::with_notifier(config, notifier).unwrap());
    registry
        .add_configured_ports(&[PortParams::new(5, HostPortType::Synthetic)])
        .unwrap();

    let worker = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.hv_create_nic(&vm_nic(5, HostNicState::Connected)))
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        registry.find_by_identity(5, 0).unwrap().state,
        VportState::PortCreated
    );

    registry.activate();
    worker.join().unwrap().unwrap();
    assert_eq!(
        registry.find_by_identity(5, 0).unwrap().state,
        VportState::Connected
    );
}

/// Observer that queries the registry from inside the event callback
struct ReentrantObserver {
    registry: Mutex<Weak<VportRegistry>>,
    seen: Mutex<Vec<(u32, Option<VportState>)>>,
}

impl EventNotifier for ReentrantObserver {
    fn post_event(&self, port_no: u32, _events: VportEvents) {
        let registry = self.registry.lock().upgrade();
        let state = registry.and_then(|r| r.find_by_port_no(port_no)).map(|v| v.state);
        self.seen.lock().push((port_no, state));
    }
}

#[test]
fn test_observer_can_call_back_into_registry() {
    let observer = Arc::new(ReentrantObserver {
        registry: Mutex::new(Weak::new()),
        seen: Mutex::new(Vec::new()),
    });
    let registry = Arc::new(
        VportRegistry::with_notifier(RegistryConfig::default(), observer.clone()).unwrap(),
    );
    *observer.registry.lock() = Arc::downgrade(&registry);
    registry.activate();

    registry
        .hv_create_port(&PortParams::new(5, HostPortType::Synthetic))
        .unwrap();
    registry
        .bind_port(HvIdentity::port(5), 3, Some("vif3"), 0)
        .unwrap();
    registry
        .hv_create_nic(&vm_nic(5, HostNicState::Connected))
        .unwrap();

    assert_eq!(*observer.seen.lock(), vec![(3, Some(VportState::Connected))]);
}

#[test]
fn test_concurrent_notifications_and_queries() {
    let setup = TestSetup::new();
    let ports: Vec<u32> = (1..=16).collect();
    for &port_id in &ports {
        setup.create_port(port_id, HostPortType::Synthetic);
        setup.bind(port_id, 0, port_id + 100, &format!("vif{}", port_id));
        setup
            .registry
            .hv_create_nic(&vm_nic(port_id, HostNicState::Created))
            .unwrap();
    }

    let writers: Vec<_> = ports
        .chunks(4)
        .map(|chunk| {
            let registry = Arc::clone(&setup.registry);
            let chunk = chunk.to_vec();
            thread::spawn(move || {
                for _ in 0..50 {
                    for &port_id in &chunk {
                        let nic = vm_nic(port_id, HostNicState::Connected);
                        registry.hv_connect_nic(&nic).unwrap();
                        registry.hv_disconnect_nic(&nic).unwrap();
                    }
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&setup.registry);
            thread::spawn(move || {
                for i in 0..500u32 {
                    let port_no = 101 + (i % 16);
                    let record = registry.describe(&QueryKey::PortNo(port_no)).unwrap();
                    assert_eq!(record.port_no, port_no);
                    assert!(record.status.contains(VportEvents::CONNECT));
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    for &port_id in &ports {
        assert_eq!(setup.state(port_id, 0), Some(VportState::NicCreated));
    }
    // create + 50 x (connect, disconnect) per port
    assert_eq!(setup.notifier.take().len(), ports.len() * 101);
    setup.registry.validate().unwrap();
}

#[tokio::test]
async fn test_channel_notifier_delivers_in_order() {
    let (notifier, mut rx) = ChannelNotifier::new();
    let registry = VportRegistry::with_notifier(RegistryConfig::default(), Arc::new(notifier))
        .unwrap();
    registry.activate();
    registry
        .hv_create_port(&PortParams::new(5, HostPortType::Synthetic))
        .unwrap();
    registry
        .bind_port(HvIdentity::port(5), 3, None, 0)
        .unwrap();

    let nic = vm_nic(5, HostNicState::Created);
    registry.hv_create_nic(&nic).unwrap();
    registry.hv_connect_nic(&nic).unwrap();

    assert_eq!(rx.recv().await.unwrap().events, VportEvents::CONNECT);
    assert_eq!(rx.recv().await.unwrap().events, VportEvents::LINK_UP);
}

#[test]
fn test_replay_events_from_json() {
    let setup = TestSetup::new();
    let json = r#"[
        { "event": "port_create", "params": { "port_id": 8, "port_type": "emulated" } },
        { "event": "nic_create",  "params": { "port_id": 8, "nic_type": "emulated", "nic_state": "created" } },
        { "event": "nic_connect", "params": { "port_id": 8, "nic_type": "emulated" } }
    ]"#;
    let events: Vec<FabricEvent> = serde_json::from_str(json).unwrap();
    for event in &events {
        setup.registry.dispatch(event).unwrap();
    }
    assert_eq!(setup.state(8, 0), Some(VportState::Connected));
    // Never bound to a port number, so nothing was posted
    assert!(setup.notifier.take().is_empty());
}

#[test]
fn test_capacity_limit() {
    let setup = TestSetup::with_config(RegistryConfig {
        max_vports: 2,
        ..Default::default()
    });
    setup.create_port(1, HostPortType::Synthetic);
    setup.create_port(2, HostPortType::Synthetic);
    let err = setup
        .registry
        .hv_create_port(&PortParams::new(3, HostPortType::Synthetic))
        .unwrap_err();
    assert!(matches!(err, VportError::ResourceExhausted(_)));
    assert_eq!(setup.registry.len(), 2);
}

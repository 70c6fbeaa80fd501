//! VportRegistry - shared vport store and its control-plane operations
//!
//! The registry owns the [`VportStore`] behind a single reader/writer lock.
//! Every mutation runs with the write lock held and records the side effects
//! it needs (event posts, host adapter calls, released tunnel state) in a
//! [`Deferred`] batch that is only run after the lock is dropped, so
//! observers and hooks may call straight back into the lookup APIs.
//!
//! Fabric notification handlers live in [`crate::lifecycle`]; read-side
//! lookups and the query projection live in [`crate::query`].

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activation::{ActivationGate, ActivationState};
use crate::config::RegistryConfig;
use crate::entry::{
    StatsDelta, TunnelContext, VportEntry, VportKind, VportState, VxlanContext,
    DP_PORT_NUMBER_INVALID, DP_PORT_NUMBER_LOCAL, EXTERNAL_VIRTUAL_ADAPTER_NAME, MAX_DP_PORTS,
};
use crate::error::{Result, VportError};
use crate::events::{EventNotifier, NullNotifier, VportEvents};
use crate::fabric::{FabricEvent, NicParams, PortParams};
use crate::identity::{HvIdentity, VportName};
use crate::store::{SingletonSlot, VportId, VportStore};

/// Host-side effects of vport transitions.
///
/// Invoked after the registry lock is released. Every method defaults to a
/// no-op so embedders only implement what their host provides.
pub trait HostHooks: Send + Sync {
    /// The host's internal adapter gained a live NIC.
    fn internal_adapter_up(&self, _port_no: u32, _net_cfg_instance_id: Uuid) {}

    /// The host's internal adapter lost its NIC or was removed.
    fn internal_adapter_down(&self) {}

    /// Kind-specific tunnel state of a removed vport must be released.
    fn release_tunnel(&self, _port_no: u32, _tunnel: &TunnelContext) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl HostHooks for NoopHooks {}

/// Parameters of a datapath-created tunnel vport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub kind: VportKind,
    pub name: String,
    pub port_no: u32,
    /// VXLAN destination UDP port; defaults to the IANA port.
    #[serde(default)]
    pub dst_port: Option<u16>,
    #[serde(default)]
    pub upcall_pid: u32,
}

impl TunnelRequest {
    pub fn vxlan(name: impl Into<String>, port_no: u32) -> Self {
        Self {
            kind: VportKind::TunnelVxlan,
            name: name.into(),
            port_no,
            dst_port: None,
            upcall_pid: 0,
        }
    }
}

/// Side effects collected under the write lock.
#[derive(Default)]
pub(crate) struct Deferred {
    events: Vec<(u32, VportEvents)>,
    unposted: Vec<(Option<HvIdentity>, VportEvents)>,
    internal_up: Option<(u32, Uuid)>,
    internal_down: bool,
    released: Vec<VportEntry>,
}

impl Deferred {
    /// Queue an event; dropped unless the entry holds a datapath port number.
    pub(crate) fn post(&mut self, vport: &VportEntry, events: VportEvents) {
        if events.is_empty() {
            return;
        }
        if vport.has_port_no() {
            self.events.push((vport.port_no, events));
        } else {
            self.unposted.push((vport.identity, events));
        }
    }

    pub(crate) fn internal_up(&mut self, port_no: u32, net_cfg_instance_id: Uuid) {
        self.internal_up = Some((port_no, net_cfg_instance_id));
        self.internal_down = false;
    }

    pub(crate) fn internal_down(&mut self) {
        self.internal_up = None;
        self.internal_down = true;
    }

    pub(crate) fn release(&mut self, vport: VportEntry) {
        self.released.push(vport);
    }
}

/// Thread-safe vport registry.
pub struct VportRegistry {
    config: RegistryConfig,
    store: RwLock<VportStore>,
    gate: ActivationGate,
    notifier: Arc<dyn EventNotifier>,
    hooks: Arc<dyn HostHooks>,
}

impl fmt::Debug for VportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VportRegistry")
            .field("config", &self.config)
            .field("activation", &self.gate.state())
            .field("vports", &self.store.read().len())
            .finish_non_exhaustive()
    }
}

impl VportRegistry {
    /// Create an empty registry.
    pub fn new(
        config: RegistryConfig,
        notifier: Arc<dyn EventNotifier>,
        hooks: Arc<dyn HostHooks>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, notifier, hooks))
    }

    fn build(
        config: RegistryConfig,
        notifier: Arc<dyn EventNotifier>,
        hooks: Arc<dyn HostHooks>,
    ) -> Self {
        let store = VportStore::new(config.buckets(), config.max_vports);
        info!(
            datapath_no = config.datapath_no,
            buckets = config.buckets(),
            max_vports = config.max_vports,
            "Vport registry initialized"
        );
        Self {
            config,
            store: RwLock::new(store),
            gate: ActivationGate::new(),
            notifier,
            hooks,
        }
    }

    /// Registry with no host hooks.
    pub fn with_notifier(config: RegistryConfig, notifier: Arc<dyn EventNotifier>) -> Result<Self> {
        Self::new(config, notifier, Arc::new(NoopHooks))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, VportStore> {
        self.store.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, VportStore> {
        self.store.write()
    }

    /// Run side effects collected under the lock. Must not be called with
    /// the lock held.
    pub(crate) fn run_deferred(&self, deferred: Deferred) {
        for vport in &deferred.released {
            debug!(
                identity = ?vport.identity,
                port_no = vport.port_no,
                kind = %vport.kind,
                "Vport removed"
            );
            if let Some(tunnel) = &vport.tunnel {
                debug!(port_no = vport.port_no, kind = %vport.kind, "Releasing tunnel context");
                self.hooks.release_tunnel(vport.port_no, tunnel);
            }
        }
        if deferred.internal_down {
            self.hooks.internal_adapter_down();
        }
        if let Some((port_no, guid)) = deferred.internal_up {
            self.hooks.internal_adapter_up(port_no, guid);
        }
        for (identity, events) in deferred.unposted {
            debug!(?identity, ?events, "Vport has no port number, event not posted");
        }
        for (port_no, events) in deferred.events {
            debug!(port_no, ?events, "Posting vport event");
            self.notifier.post_event(port_no, events);
        }
    }

    // ---- Activation --------------------------------------------------------

    pub fn activation_state(&self) -> ActivationState {
        self.gate.state()
    }

    pub fn is_activated(&self) -> bool {
        self.gate.is_activated()
    }

    /// Publish switch activation and release waiting NIC notifications.
    #[instrument(skip(self))]
    pub fn activate(&self) -> bool {
        let published = self.gate.activate();
        if published {
            info!("Switch activated");
        } else {
            warn!(state = ?self.gate.state(), "Activation already decided");
        }
        published
    }

    /// Publish a permanent activation failure.
    #[instrument(skip(self))]
    pub fn fail_activation(&self) -> bool {
        let published = self.gate.fail();
        if published {
            error!("Switch activation failed");
        }
        published
    }

    /// Wait for activation under the configured policy.
    pub(crate) fn wait_activated(&self) -> Result<()> {
        self.gate.wait(self.config.activation_timeout())
    }

    // ---- Bootstrap ---------------------------------------------------------

    /// Register the ports enumerated by the fabric at switch attach.
    ///
    /// Validation ports are skipped. Any failure clears the whole registry so
    /// attach can be retried from scratch.
    #[instrument(skip(self, ports), fields(count = ports.len()))]
    pub fn add_configured_ports(&self, ports: &[PortParams]) -> Result<usize> {
        for params in ports.iter().filter(|p| p.is_validation_port) {
            debug!(port_id = params.port_id, "Skipping validation port");
        }

        let mut added = 0;
        let result = {
            let mut store = self.write();
            ports
                .iter()
                .filter(|params| !params.is_validation_port)
                .try_for_each(|params| {
                    insert_port(&mut store, params)?;
                    added += 1;
                    Ok::<(), VportError>(())
                })
        };

        if let Err(e) = result {
            error!(error = %e, added, "Failed to add configured ports, clearing registry");
            self.clear_all();
            return Err(e);
        }
        info!(added, "Configured switch ports added");
        Ok(added)
    }

    /// Attach the NICs enumerated by the fabric at switch attach.
    ///
    /// Physical adapters behind the external port get their own sub-entries;
    /// other NICs are merged into the owning port entry. Problems with a
    /// single NIC are logged and skipped. No events are posted.
    #[instrument(skip(self, nics), fields(count = nics.len()))]
    pub fn init_configured_nics(&self, nics: &[NicParams]) -> usize {
        let mut deferred = Deferred::default();
        let mut attached = 0;
        let mut skipped = Vec::new();
        {
            let mut store = self.write();
            for nic in nics {
                match attach_nic(&mut store, nic) {
                    Ok(id) => {
                        if let Some(vport) = store.get(id).filter(|v| v.kind.is_internal()) {
                            deferred.internal_up(vport.port_no, vport.net_cfg_instance_id);
                        }
                        attached += 1;
                    }
                    Err(e) => skipped.push((nic.identity(), e)),
                }
            }
        }
        for (identity, e) in skipped {
            warn!(%identity, error = %e, "Skipping configured NIC");
        }
        self.run_deferred(deferred);
        info!(attached, "Configured switch NICs initialized");
        attached
    }

    /// Remove every entry, physical NICs before the external port.
    #[instrument(skip(self))]
    pub fn clear_all(&self) {
        let mut deferred = Deferred::default();
        let mut failures = Vec::new();
        {
            let mut store = self.write();
            let (external, others): (Vec<VportId>, Vec<VportId>) = store
                .iter()
                .map(|(id, _)| id)
                .partition(|id| store.get_singleton(SingletonSlot::External) == Some(*id));

            for id in others.into_iter().chain(external) {
                if let Err(e) = remove_vport(&mut store, id, &mut deferred) {
                    failures.push(e);
                }
            }
            debug_assert!(store.is_empty());
        }
        for e in failures {
            error!(error = %e, "Failed to remove vport during clear");
        }
        self.run_deferred(deferred);
        info!("Vport registry cleared");
    }

    // ---- Datapath admission ------------------------------------------------

    /// Bind a datapath port number, and optionally a name, to a fabric vport.
    ///
    /// Both keys are checked before either is bound.
    #[instrument(skip(self))]
    pub fn bind_port(
        &self,
        identity: HvIdentity,
        port_no: u32,
        name: Option<&str>,
        upcall_pid: u32,
    ) -> Result<()> {
        check_port_no(port_no)?;
        let name = name.map(VportName::new).transpose()?;

        {
            let mut store = self.write();
            let id = store
                .find_by_identity(identity.port_id, identity.nic_index)
                .ok_or_else(|| VportError::NotFound(identity.to_string()))?;

            if let Some(other) = store.find_by_port_no(port_no) {
                if other != id {
                    return Err(VportError::DuplicatePortNo(port_no));
                }
            }
            if let Some(name) = name {
                if name.is_empty() {
                    return Err(VportError::InvalidParameter("empty vport name".to_string()));
                }
                if let Some(other) = store.find_by_name(&name) {
                    if other != id {
                        return Err(VportError::DuplicateName(name.to_string()));
                    }
                }
            }

            store.bind_port_no(id, port_no)?;
            if let Some(name) = name {
                store.bind_name(id, name)?;
            }
            if let Some(vport) = store.get_mut(id) {
                vport.upcall_pid = upcall_pid;
            }
        }
        info!(%identity, port_no, "Vport bound to datapath");
        Ok(())
    }

    /// Release the datapath port number and name of a fabric vport.
    #[instrument(skip(self))]
    pub fn unbind_port(&self, port_no: u32) -> Result<()> {
        {
            let mut store = self.write();
            let id = store
                .find_by_port_no(port_no)
                .ok_or_else(|| VportError::NotFound(format!("port number {}", port_no)))?;
            if store.get(id).is_some_and(|v| v.kind.is_tunnel()) {
                return Err(VportError::InvalidParameter(format!(
                    "port number {} is a tunnel, delete it instead",
                    port_no
                )));
            }
            store.unbind(id)?;
            if let Some(vport) = store.get_mut(id) {
                vport.upcall_pid = 0;
            }
        }
        info!(port_no, "Vport unbound from datapath");
        Ok(())
    }

    // ---- Tunnels -----------------------------------------------------------

    /// Create a tunnel vport on behalf of the datapath.
    #[instrument(skip(self), fields(kind = %req.kind, name = %req.name))]
    pub fn add_tunnel_vport(&self, req: &TunnelRequest) -> Result<()> {
        if !req.kind.is_tunnel() {
            return Err(VportError::InvalidParameter(format!(
                "{} is not a tunnel kind",
                req.kind
            )));
        }
        check_port_no(req.port_no)?;
        let name = VportName::new(&req.name)?;
        if name.is_empty() {
            return Err(VportError::InvalidParameter("empty tunnel name".to_string()));
        }

        let context = match req.kind {
            VportKind::TunnelVxlan => Some(TunnelContext::Vxlan(VxlanContext {
                dst_port: req.dst_port.unwrap_or(VxlanContext::DEFAULT_DST_PORT),
            })),
            _ => None,
        };
        let mut vport = VportEntry::tunnel(req.kind, name, context);
        vport.port_no = req.port_no;
        vport.upcall_pid = req.upcall_pid;

        self.write().insert(vport)?;
        info!(port_no = req.port_no, "Tunnel vport added");
        Ok(())
    }

    /// Delete a tunnel vport and release its context.
    #[instrument(skip(self))]
    pub fn delete_tunnel_vport(&self, port_no: u32) -> Result<()> {
        let mut deferred = Deferred::default();
        {
            let mut store = self.write();
            let id = store
                .find_by_port_no(port_no)
                .ok_or_else(|| VportError::NotFound(format!("port number {}", port_no)))?;
            if !store.get(id).is_some_and(|v| v.kind.is_tunnel()) {
                return Err(VportError::InvalidParameter(format!(
                    "port number {} is not a tunnel",
                    port_no
                )));
            }
            remove_vport(&mut store, id, &mut deferred)?;
        }
        self.run_deferred(deferred);
        info!(port_no, "Tunnel vport deleted");
        Ok(())
    }

    // ---- Forwarding path ---------------------------------------------------

    /// Add counter increments to a vport.
    pub fn record_stats(&self, port_no: u32, delta: &StatsDelta) -> Result<()> {
        let mut store = self.write();
        let id = store
            .find_by_port_no(port_no)
            .ok_or_else(|| VportError::NotFound(format!("port number {}", port_no)))?;
        if let Some(vport) = store.get_mut(id) {
            vport.record_stats(delta);
        }
        Ok(())
    }

    // ---- Dispatch ----------------------------------------------------------

    /// Route one fabric notification to its handler.
    ///
    /// Notifications for unknown identities are logged and ignored; every
    /// other failure is returned to the caller.
    pub fn dispatch(&self, event: &FabricEvent) -> Result<()> {
        let result = match event {
            FabricEvent::PortCreate(p) => self.hv_create_port(p),
            FabricEvent::PortTeardown(p) => self.hv_teardown_port(p),
            FabricEvent::PortDelete(p) => self.hv_delete_port(p),
            FabricEvent::NicCreate(n) => self.hv_create_nic(n),
            FabricEvent::NicConnect(n) => self.hv_connect_nic(n),
            FabricEvent::NicUpdate(n) => self.hv_update_nic(n),
            FabricEvent::NicDisconnect(n) => self.hv_disconnect_nic(n),
            FabricEvent::NicDelete(n) => self.hv_delete_nic(n),
        };
        match result {
            Err(VportError::NotFound(key)) => {
                warn!(event = %event, key = %key, "Notification for unknown vport ignored");
                Ok(())
            }
            Err(e) => {
                if e.is_contract_violation() {
                    error!(
                        event = %event,
                        error = %e,
                        "Fabric notification violated the vport protocol"
                    );
                }
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Cross-check every index against the arena.
    pub fn validate(&self) -> Result<()> {
        self.read().validate()
    }
}

impl Default for VportRegistry {
    fn default() -> Self {
        let config = RegistryConfig::default();
        debug_assert!(config.validate().is_ok());
        Self::build(config, Arc::new(NullNotifier), Arc::new(NoopHooks))
    }
}

/// Reject reserved and out-of-range datapath port numbers.
fn check_port_no(port_no: u32) -> Result<()> {
    if port_no == DP_PORT_NUMBER_LOCAL || port_no >= DP_PORT_NUMBER_INVALID {
        return Err(VportError::InvalidParameter(format!(
            "port number {} outside 1-{}",
            port_no,
            MAX_DP_PORTS - 1
        )));
    }
    Ok(())
}

/// Default datapath name of external entries.
pub(crate) fn default_name(vport: &VportEntry) -> Option<VportName> {
    if vport.is_external_port() {
        VportName::new(EXTERNAL_VIRTUAL_ADAPTER_NAME).ok()
    } else if vport.is_physical_nic() {
        VportName::new(&format!("external.{}", vport.nic_index())).ok()
    } else {
        None
    }
}

/// Insert a named entry built from port parameters.
pub(crate) fn insert_port(store: &mut VportStore, params: &PortParams) -> Result<VportId> {
    let mut vport = VportEntry::from_port_params(params);
    vport.name = default_name(&vport);
    store.insert(vport)
}

/// Merge NIC create parameters into the registry, creating the physical
/// adapter sub-entry when the NIC is one.
///
/// A NIC merged into an existing port requires that port to be in
/// `PortCreated`; the entry is untouched on rejection.
pub(crate) fn attach_nic(store: &mut VportStore, nic: &NicParams) -> Result<VportId> {
    if nic.is_physical_nic() {
        let external = store
            .find_by_identity(nic.port_id, 0)
            .and_then(|id| store.get(id))
            .filter(|v| v.is_external_port())
            .ok_or_else(|| {
                VportError::InvalidParameter(format!(
                    "physical NIC {} without its external port",
                    nic.identity()
                ))
            })?;
        let mut vport = VportEntry::physical_nic(external, nic.nic_index);
        vport.name = default_name(&vport);
        vport.apply_nic_params(nic);
        return store.insert(vport);
    }

    if nic.nic_index != 0 {
        return Err(VportError::InvalidParameter(format!(
            "{:?} NIC {} must use NIC index 0",
            nic.nic_type,
            nic.identity()
        )));
    }
    let id = store.find_by_identity(nic.port_id, 0).ok_or_else(|| {
        VportError::InvalidParameter(format!("no port for NIC {}", nic.identity()))
    })?;
    let vport = store.get_mut(id).ok_or_else(|| {
        VportError::InvariantViolation(format!("stale index for {}", nic.identity()))
    })?;
    if vport.state != VportState::PortCreated {
        return Err(VportError::InvalidParameter(format!(
            "NIC {} created on a port in state {}",
            nic.identity(),
            vport.state
        )));
    }
    vport.apply_nic_params(nic);
    Ok(id)
}

/// Unlink an entry from every index and queue its teardown side effects.
pub(crate) fn remove_vport(
    store: &mut VportStore,
    id: VportId,
    deferred: &mut Deferred,
) -> Result<()> {
    let vport = store.remove(id)?;
    if vport.kind.is_internal() {
        deferred.internal_down();
    }
    deferred.release(vport);
    Ok(())
}

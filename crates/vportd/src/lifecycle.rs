//! Fabric notification handlers
//!
//! One handler per host switch notification. Each handler takes the registry
//! write lock, applies its row of the state machine, and posts the resulting
//! event only after the lock is released:
//!
//! | Notification   | Precondition          | New state                | Event              |
//! |----------------|-----------------------|--------------------------|--------------------|
//! | port create    | identity absent       | from host port state     | none               |
//! | port teardown  | entry exists          | `PortTearDown`           | none               |
//! | port delete    | entry exists          | removed                  | none               |
//! | NIC create     | port in `PortCreated` | from host NIC state      | CONNECT [+LINK_UP] |
//! | NIC connect    | entry exists          | `Connected`              | LINK_UP            |
//! | NIC update     | entry exists          | unchanged                | MAC/MTU changes    |
//! | NIC disconnect | entry exists          | `NicCreated`             | LINK_DOWN          |
//! | NIC delete     | entry exists          | `PortCreated` or removed | DISCONNECT         |
//!
//! NIC notifications wait for switch activation first. A NIC create that
//! cannot proceed is vetoed with an error; the other NIC notifications are
//! logged and dropped.

use tracing::{debug, error, info, instrument, warn};

use crate::entry::VportState;
use crate::error::{Result, VportError};
use crate::events::VportEvents;
use crate::fabric::{HostNicState, HostPortState, NicParams, PortParams};
use crate::registry::{attach_nic, insert_port, remove_vport, Deferred, VportRegistry};
use crate::store::{VportId, VportStore};

impl VportRegistry {
    /// Register a new fabric port.
    #[instrument(
        skip(self, params),
        fields(port_id = params.port_id, port_type = ?params.port_type)
    )]
    pub fn hv_create_port(&self, params: &PortParams) -> Result<()> {
        let result = create_port(&mut self.write(), params);
        match &result {
            Ok(state) => info!(%state, "Port created"),
            Err(e @ VportError::DuplicateIdentity(_)) => {
                warn!(error = %e, "Port already registered")
            }
            Err(e) => error!(error = %e, "Failed to create vport"),
        }
        result.map(drop)
    }

    /// Mark a port as being torn down; it stays registered until deleted.
    #[instrument(skip(self, params), fields(port_id = params.port_id))]
    pub fn hv_teardown_port(&self, params: &PortParams) -> Result<()> {
        note_missing(teardown_port(&mut self.write(), params))?;
        debug!("Port tearing down");
        Ok(())
    }

    /// Remove a port entry from the registry.
    #[instrument(skip(self, params), fields(port_id = params.port_id))]
    pub fn hv_delete_port(&self, params: &PortParams) -> Result<()> {
        let mut deferred = Deferred::default();
        note_missing(delete_port(&mut self.write(), params, &mut deferred))?;
        self.run_deferred(deferred);
        info!("Port deleted");
        Ok(())
    }

    /// Attach a NIC to its port, creating a sub-entry for physical adapters.
    #[instrument(
        skip(self, nic),
        fields(port_id = nic.port_id, nic_index = nic.nic_index, nic_type = ?nic.nic_type)
    )]
    pub fn hv_create_nic(&self, nic: &NicParams) -> Result<()> {
        if let Err(e) = self.wait_activated() {
            warn!(error = %e, "Switch not activated, vetoing NIC create");
            return Err(e);
        }

        let mut deferred = Deferred::default();
        let result = create_nic(&mut self.write(), nic, &mut deferred);
        let state = result.map_err(|e| {
            error!(error = %e, "Failed to create NIC");
            e
        })?;
        self.run_deferred(deferred);
        debug!(%state, "NIC created");
        Ok(())
    }

    /// Mark a NIC as connected.
    #[instrument(skip(self, nic), fields(port_id = nic.port_id, nic_index = nic.nic_index))]
    pub fn hv_connect_nic(&self, nic: &NicParams) -> Result<()> {
        if !self.nic_gate_open() {
            return Ok(());
        }

        let mut deferred = Deferred::default();
        note_missing(connect_nic(&mut self.write(), nic, &mut deferred))?;
        self.run_deferred(deferred);
        debug!("NIC connected");
        Ok(())
    }

    /// Refresh NIC attributes, posting only the changes observed.
    #[instrument(skip(self, nic), fields(port_id = nic.port_id, nic_index = nic.nic_index))]
    pub fn hv_update_nic(&self, nic: &NicParams) -> Result<()> {
        if !self.nic_gate_open() {
            return Ok(());
        }

        let mut deferred = Deferred::default();
        let events = note_missing(update_nic(&mut self.write(), nic, &mut deferred))?;
        self.run_deferred(deferred);
        if !events.is_empty() {
            debug!(?events, "NIC attributes changed");
        }
        Ok(())
    }

    /// Mark a NIC as disconnected; the NIC stays attached.
    #[instrument(skip(self, nic), fields(port_id = nic.port_id, nic_index = nic.nic_index))]
    pub fn hv_disconnect_nic(&self, nic: &NicParams) -> Result<()> {
        if !self.nic_gate_open() {
            return Ok(());
        }

        let mut deferred = Deferred::default();
        note_missing(disconnect_nic(&mut self.write(), nic, &mut deferred))?;
        self.run_deferred(deferred);
        debug!("NIC disconnected");
        Ok(())
    }

    /// Detach a NIC. Physical adapter sub-entries are removed outright.
    #[instrument(skip(self, nic), fields(port_id = nic.port_id, nic_index = nic.nic_index))]
    pub fn hv_delete_nic(&self, nic: &NicParams) -> Result<()> {
        if !self.nic_gate_open() {
            return Ok(());
        }

        let mut deferred = Deferred::default();
        note_missing(delete_nic(&mut self.write(), nic, &mut deferred))?;
        self.run_deferred(deferred);
        debug!("NIC deleted");
        Ok(())
    }

    /// Wait for activation; false if the notification must be dropped.
    fn nic_gate_open(&self) -> bool {
        match self.wait_activated() {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Switch not activated, NIC notification dropped");
                false
            }
        }
    }
}

// Transitions below run with the write lock held and must not log.

fn create_port(store: &mut VportStore, params: &PortParams) -> Result<VportState> {
    if store.find_by_identity(params.port_id, 0).is_some() {
        return Err(VportError::DuplicateIdentity(params.identity()));
    }
    let id = insert_port(store, params)?;
    Ok(store.get(id).map_or(VportState::Unknown, |v| v.state))
}

fn teardown_port(store: &mut VportStore, params: &PortParams) -> Result<()> {
    let id = find_port(store, params)?;
    if let Some(vport) = store.get_mut(id) {
        vport.port_state = HostPortState::Teardown;
        vport.state = VportState::PortTearDown;
    }
    Ok(())
}

fn delete_port(store: &mut VportStore, params: &PortParams, deferred: &mut Deferred) -> Result<()> {
    let id = find_port(store, params)?;
    remove_vport(store, id, deferred)
}

fn create_nic(
    store: &mut VportStore,
    nic: &NicParams,
    deferred: &mut Deferred,
) -> Result<VportState> {
    let id = attach_nic(store, nic)?;
    let vport = store.get(id).ok_or_else(|| {
        VportError::InvariantViolation(format!("NIC {} attached to nothing", nic.identity()))
    })?;
    let events = match vport.state {
        VportState::Connected => VportEvents::CONNECT | VportEvents::LINK_UP,
        VportState::NicCreated => VportEvents::CONNECT,
        _ => VportEvents::empty(),
    };
    deferred.post(vport, events);
    Ok(vport.state)
}

fn connect_nic(store: &mut VportStore, nic: &NicParams, deferred: &mut Deferred) -> Result<()> {
    let id = find_nic(store, nic)?;
    if let Some(vport) = store.get_mut(id) {
        vport.state = VportState::Connected;
        vport.nic_state = HostNicState::Connected;
        deferred.post(vport, VportEvents::LINK_UP);
        if vport.kind.is_internal() {
            deferred.internal_up(vport.port_no, vport.net_cfg_instance_id);
        }
    }
    Ok(())
}

fn update_nic(
    store: &mut VportStore,
    nic: &NicParams,
    deferred: &mut Deferred,
) -> Result<VportEvents> {
    let id = find_nic(store, nic)?;
    let mut events = VportEvents::empty();
    if let Some(vport) = store.get_mut(id) {
        events = vport.apply_nic_update(nic);
        deferred.post(vport, events);
    }
    Ok(events)
}

fn disconnect_nic(store: &mut VportStore, nic: &NicParams, deferred: &mut Deferred) -> Result<()> {
    let id = find_nic(store, nic)?;
    if let Some(vport) = store.get_mut(id) {
        vport.nic_state = HostNicState::Disconnected;
        vport.state = VportState::NicCreated;
        deferred.post(vport, VportEvents::LINK_DOWN);
        if vport.kind.is_internal() {
            deferred.internal_down();
        }
    }
    Ok(())
}

fn delete_nic(store: &mut VportStore, nic: &NicParams, deferred: &mut Deferred) -> Result<()> {
    let id = find_nic(store, nic)?;
    let physical = match store.get_mut(id) {
        Some(vport) => {
            deferred.post(vport, VportEvents::DISCONNECT);
            if !vport.is_physical_nic() {
                vport.nic_state = HostNicState::Unknown;
                vport.state = VportState::PortCreated;
            }
            vport.is_physical_nic()
        }
        None => false,
    };
    if physical {
        remove_vport(store, id, deferred)?;
    }
    Ok(())
}

fn find_port(store: &VportStore, params: &PortParams) -> Result<VportId> {
    store
        .find_by_identity(params.port_id, 0)
        .ok_or_else(|| VportError::NotFound(params.identity().to_string()))
}

fn find_nic(store: &VportStore, nic: &NicParams) -> Result<VportId> {
    store
        .find_by_identity(nic.port_id, nic.nic_index)
        .ok_or_else(|| VportError::NotFound(nic.identity().to_string()))
}

/// Log a failed identity lookup; call only after the lock is released.
fn note_missing<T>(result: Result<T>) -> Result<T> {
    if let Err(VportError::NotFound(key)) = &result {
        warn!(%key, "Vport not present");
    }
    result
}

//! Multi-index vport store.
//!
//! Entries live in a [`Slab`] arena and are reachable through three
//! independent index maps plus two singleton slots:
//!
//! ```text
//!   by_port_no  : u32         ─┐
//!   by_identity : HvIdentity  ─┼──> VportId ──> Slab<VportEntry>
//!   by_name     : VportName   ─┘
//!   external    : Option<VportId>   (external port, NIC index 0)
//!   internal    : Option<VportId>   (host internal adapter)
//! ```
//!
//! The store holds no lock; callers serialize mutation (see
//! [`VportRegistry`](crate::VportRegistry)). Every mutating method validates
//! all keys before touching any index, so a failed call leaves the store
//! exactly as it was.

use ahash::RandomState;
use slab::Slab;
use std::collections::HashMap;

use crate::entry::{VportEntry, VportKind};
use crate::error::{Result, VportError};
use crate::identity::{HvIdentity, VportName};

/// Stable handle to an entry in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VportId(usize);

/// Dedicated single-entry references outside the hashed indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingletonSlot {
    Internal,
    External,
}

type Index<K> = HashMap<K, VportId, RandomState>;

/// Arena plus index maps.
#[derive(Debug)]
pub struct VportStore {
    vports: Slab<VportEntry>,
    by_port_no: Index<u32>,
    by_identity: Index<HvIdentity>,
    by_name: Index<VportName>,
    external: Option<VportId>,
    internal: Option<VportId>,
    num_physical_nics: usize,
    max_vports: usize,
}

impl VportStore {
    /// Creates a store whose indices start with `buckets` slots (rounded up to
    /// a power of two) and which admits at most `max_vports` entries.
    pub fn new(buckets: usize, max_vports: usize) -> Self {
        let buckets = buckets.max(1).next_power_of_two();
        Self {
            vports: Slab::with_capacity(buckets),
            by_port_no: HashMap::with_capacity_and_hasher(buckets, RandomState::new()),
            by_identity: HashMap::with_capacity_and_hasher(buckets, RandomState::new()),
            by_name: HashMap::with_capacity_and_hasher(buckets, RandomState::new()),
            external: None,
            internal: None,
            num_physical_nics: 0,
            max_vports,
        }
    }

    /// Total number of entries, singletons and tunnels included.
    pub fn len(&self) -> usize {
        self.vports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vports.is_empty()
    }

    /// Entries registered in the port-id index.
    pub fn num_vports(&self) -> usize {
        self.by_identity.len()
    }

    /// Physical adapters teamed behind the external port.
    pub fn num_physical_nics(&self) -> usize {
        self.num_physical_nics
    }

    pub fn get(&self, id: VportId) -> Option<&VportEntry> {
        self.vports.get(id.0)
    }

    /// Mutable access for non-key fields.
    ///
    /// `port_no`, `name` and `identity` are index keys and must only change
    /// through [`bind_port_no`](Self::bind_port_no),
    /// [`bind_name`](Self::bind_name) and [`unbind`](Self::unbind).
    pub fn get_mut(&mut self, id: VportId) -> Option<&mut VportEntry> {
        self.vports.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (VportId, &VportEntry)> {
        self.vports.iter().map(|(key, vport)| (VportId(key), vport))
    }

    pub fn find_by_port_no(&self, port_no: u32) -> Option<VportId> {
        self.by_port_no.get(&port_no).copied()
    }

    /// Resolve a fabric identity, checking the external slot first.
    pub fn find_by_identity(&self, port_id: u32, nic_index: u32) -> Option<VportId> {
        if nic_index == 0 {
            if let Some(id) = self.external {
                if self.vports[id.0].port_id() == port_id {
                    return Some(id);
                }
            }
        }
        self.by_identity
            .get(&HvIdentity::new(port_id, nic_index))
            .copied()
    }

    pub fn find_by_name(&self, name: &VportName) -> Option<VportId> {
        self.by_name.get(name).copied()
    }

    /// Scan the port-id index for a fabric friendly name.
    pub fn find_by_hv_name(&self, name: &[u8]) -> Option<VportId> {
        self.by_identity
            .values()
            .copied()
            .find(|id| self.vports[id.0].friendly_name.matches_narrow(name))
    }

    pub fn get_singleton(&self, slot: SingletonSlot) -> Option<VportId> {
        match slot {
            SingletonSlot::Internal => self.internal,
            SingletonSlot::External => self.external,
        }
    }

    /// Point a singleton slot at an entry, or clear it.
    ///
    /// The entry must exist and be of the slot's kind; occupying an already
    /// occupied slot is a duplicate.
    pub fn set_singleton(&mut self, slot: SingletonSlot, id: Option<VportId>) -> Result<()> {
        if let Some(id) = id {
            let vport = self.get(id).ok_or_else(|| {
                VportError::InvariantViolation(format!("singleton {:?} set to missing entry", slot))
            })?;
            let fits = match slot {
                SingletonSlot::Internal => vport.kind == VportKind::Internal,
                SingletonSlot::External => vport.is_external_port(),
            };
            if !fits {
                return Err(VportError::InvariantViolation(format!(
                    "{} vport cannot occupy the {:?} slot",
                    vport.kind, slot
                )));
            }
            let current = self.get_singleton(slot);
            if current.is_some() && current != Some(id) {
                return Err(VportError::DuplicateIdentity(
                    vport.identity.unwrap_or(HvIdentity::port(0)),
                ));
            }
        }
        match slot {
            SingletonSlot::Internal => self.internal = id,
            SingletonSlot::External => self.external = id,
        }
        Ok(())
    }

    /// Add an entry to every index it is eligible for.
    pub fn insert(&mut self, vport: VportEntry) -> Result<VportId> {
        self.check_insert(&vport)?;

        let external_port = vport.is_external_port();
        let physical_nic = vport.is_physical_nic();
        let internal = vport.kind == VportKind::Internal;
        let identity = vport.identity;
        let port_no = vport.has_port_no().then_some(vport.port_no);
        let name = vport.name.filter(|n| !n.is_empty());

        let id = VportId(self.vports.insert(vport));

        if external_port {
            self.external = Some(id);
        } else if let Some(identity) = identity {
            self.by_identity.insert(identity, id);
        }
        if internal {
            self.internal = Some(id);
        }
        if physical_nic {
            self.num_physical_nics += 1;
        }
        if let Some(port_no) = port_no {
            self.by_port_no.insert(port_no, id);
        }
        if let Some(name) = name {
            self.by_name.insert(name, id);
        }
        Ok(id)
    }

    fn check_insert(&self, vport: &VportEntry) -> Result<()> {
        if self.vports.len() >= self.max_vports {
            return Err(VportError::ResourceExhausted(format!(
                "vport table full ({} entries)",
                self.max_vports
            )));
        }

        if let Some(identity) = vport.identity {
            let taken = if vport.is_external_port() {
                self.external.is_some() || self.by_identity.contains_key(&identity)
            } else {
                self.find_by_identity(identity.port_id, identity.nic_index)
                    .is_some()
            };
            if taken {
                return Err(VportError::DuplicateIdentity(identity));
            }
            if vport.kind == VportKind::Internal && self.internal.is_some() {
                return Err(VportError::DuplicateIdentity(identity));
            }
            if vport.is_physical_nic() && self.external.is_none() {
                return Err(VportError::InvariantViolation(format!(
                    "physical NIC {} without an external port",
                    identity
                )));
            }
        } else if !vport.kind.is_tunnel() {
            return Err(VportError::InvariantViolation(format!(
                "{} vport without a fabric identity",
                vport.kind
            )));
        }

        if vport.has_port_no() && self.by_port_no.contains_key(&vport.port_no) {
            return Err(VportError::DuplicatePortNo(vport.port_no));
        }
        if let Some(name) = vport.name.filter(|n| !n.is_empty()) {
            if self.by_name.contains_key(&name) {
                return Err(VportError::DuplicateName(name.to_string()));
            }
        }
        Ok(())
    }

    /// Remove an entry from every index and return it.
    ///
    /// The external port cannot be removed while physical NICs are attached.
    pub fn remove(&mut self, id: VportId) -> Result<VportEntry> {
        let vport = self.get(id).ok_or_else(|| {
            VportError::InvariantViolation(format!("remove of unknown vport {:?}", id))
        })?;

        if vport.is_external_port() && self.num_physical_nics != 0 {
            return Err(VportError::InvariantViolation(format!(
                "external port removed with {} physical NICs attached",
                self.num_physical_nics
            )));
        }
        if vport.is_physical_nic() && self.num_physical_nics == 0 {
            return Err(VportError::InvariantViolation(
                "physical NIC count underflow".to_string(),
            ));
        }

        let vport = self.vports.remove(id.0);
        if let Some(identity) = vport.identity {
            if self.by_identity.get(&identity) == Some(&id) {
                self.by_identity.remove(&identity);
            }
        }
        if self.by_port_no.get(&vport.port_no) == Some(&id) {
            self.by_port_no.remove(&vport.port_no);
        }
        if let Some(name) = vport.name {
            if self.by_name.get(&name) == Some(&id) {
                self.by_name.remove(&name);
            }
        }
        if self.external == Some(id) {
            self.external = None;
        }
        if self.internal == Some(id) {
            self.internal = None;
        }
        if vport.is_physical_nic() {
            self.num_physical_nics -= 1;
        }
        Ok(vport)
    }

    /// Assign a datapath port number and index it.
    pub fn bind_port_no(&mut self, id: VportId, port_no: u32) -> Result<()> {
        let current = self.existing(id)?.port_no;
        if current == port_no {
            return Ok(());
        }
        if self.by_port_no.contains_key(&port_no) {
            return Err(VportError::DuplicatePortNo(port_no));
        }
        if self.by_port_no.get(&current) == Some(&id) {
            self.by_port_no.remove(&current);
        }
        self.by_port_no.insert(port_no, id);
        self.vports[id.0].port_no = port_no;
        Ok(())
    }

    /// Assign a datapath name and index it.
    pub fn bind_name(&mut self, id: VportId, name: VportName) -> Result<()> {
        let current = self.existing(id)?.name;
        if current == Some(name) {
            return Ok(());
        }
        if name.is_empty() {
            return Err(VportError::InvalidParameter("empty vport name".to_string()));
        }
        if self.by_name.contains_key(&name) {
            return Err(VportError::DuplicateName(name.to_string()));
        }
        if let Some(old) = current {
            if self.by_name.get(&old) == Some(&id) {
                self.by_name.remove(&old);
            }
        }
        self.by_name.insert(name, id);
        self.vports[id.0].name = Some(name);
        Ok(())
    }

    /// Drop the port number and name of an entry from their indices.
    pub fn unbind(&mut self, id: VportId) -> Result<()> {
        let vport = self.existing(id)?;
        let (port_no, name) = (vport.port_no, vport.name);
        if self.by_port_no.get(&port_no) == Some(&id) {
            self.by_port_no.remove(&port_no);
        }
        if let Some(name) = name {
            if self.by_name.get(&name) == Some(&id) {
                self.by_name.remove(&name);
            }
        }
        let vport = &mut self.vports[id.0];
        vport.port_no = crate::entry::DP_PORT_NUMBER_INVALID;
        vport.name = None;
        Ok(())
    }

    fn existing(&self, id: VportId) -> Result<&VportEntry> {
        self.get(id)
            .ok_or_else(|| VportError::InvariantViolation(format!("unknown vport {:?}", id)))
    }

    /// Check that every index agrees with the arena.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(VportError::InvariantViolation(msg));

        for (port_no, id) in &self.by_port_no {
            match self.get(*id) {
                Some(v) if v.port_no == *port_no => {}
                _ => return fail(format!("port number {} maps to a stale entry", port_no)),
            }
        }
        for (identity, id) in &self.by_identity {
            match self.get(*id) {
                Some(v) if v.identity == Some(*identity) && !v.is_external_port() => {}
                _ => return fail(format!("{} maps to a stale entry", identity)),
            }
        }
        for (name, id) in &self.by_name {
            match self.get(*id) {
                Some(v) if v.name == Some(*name) => {}
                _ => return fail(format!("name {} maps to a stale entry", name)),
            }
        }

        let mut physical = 0;
        for (id, vport) in self.iter() {
            if vport.has_port_no() && self.find_by_port_no(vport.port_no) != Some(id) {
                return fail(format!("port number {} not indexed", vport.port_no));
            }
            if let Some(name) = vport.name.filter(|n| !n.is_empty()) {
                if self.find_by_name(&name) != Some(id) {
                    return fail(format!("name {} not indexed", name));
                }
            }
            if let Some(identity) = vport.identity {
                if self.find_by_identity(identity.port_id, identity.nic_index) != Some(id) {
                    return fail(format!("{} not reachable", identity));
                }
            }
            if vport.is_physical_nic() {
                physical += 1;
            }
        }
        if physical != self.num_physical_nics {
            return fail(format!(
                "physical NIC count {} but {} sub-entries",
                self.num_physical_nics, physical
            ));
        }
        if physical != 0 && self.external.is_none() {
            return fail("physical NICs without an external port".to_string());
        }
        Ok(())
    }
}

impl Default for VportStore {
    fn default() -> Self {
        Self::new(1024, MAX_ENTRIES_DEFAULT)
    }
}

const MAX_ENTRIES_DEFAULT: usize = 4096;

//! Virtual node ids of one tunnel.
//!
//! A fixed arena of slots maps real ids on the far side of a tunnel to ids
//! that are unique on this side. Slot 0 is reserved for the partner when the
//! connection is created, so the partner id is known before the handshake
//! finishes. Lookups scan the arena linearly; it is small.

use mesh_wire::NodeId;

use crate::ConnectionError;

/// Index of a slot in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualSlot(usize);

#[derive(Debug, Clone, Copy)]
struct Entry {
    virtual_id: NodeId,
    real: Option<NodeId>,
}

/// Bidirectional virtual id table with fixed capacity
#[derive(Debug)]
pub struct VirtualIdTable {
    base: NodeId,
    slots: Vec<Option<Entry>>,
}

impl VirtualIdTable {
    /// Table handing out `base..base + capacity`, with the partner slot
    /// reserved as `partner_id` or `base`
    pub fn new(base: NodeId, capacity: usize, partner_id: Option<NodeId>) -> Self {
        let mut slots = vec![None; capacity.max(1)];
        slots[0] = Some(Entry {
            virtual_id: partner_id.unwrap_or(base),
            real: None,
        });
        Self { base, slots }
    }

    /// Virtual id reserved for the partner
    pub fn partner_id(&self) -> NodeId {
        self.slots[0].map_or(self.base, |e| e.virtual_id)
    }

    /// Bind the partner's real id to the reserved partner slot
    pub fn bind_partner(&mut self, real: NodeId) -> NodeId {
        let virtual_id = self.partner_id();
        self.slots[0] = Some(Entry {
            virtual_id,
            real: Some(real),
        });
        virtual_id
    }

    /// Virtual id for `real`, allocating a slot on first use
    pub fn assign(&mut self, real: NodeId) -> Result<NodeId, ConnectionError> {
        if let Some(existing) = self.to_virtual(real) {
            return Ok(existing);
        }
        let slot = self.free_slot().ok_or(ConnectionError::VirtualIdsExhausted)?;
        // An explicit partner id may sit anywhere inside the range
        let candidate = (0..self.slots.len())
            .map(|k| self.base.wrapping_add(k as NodeId))
            .find(|id| self.slot_of(*id).is_none())
            .ok_or(ConnectionError::VirtualIdsExhausted)?;
        self.slots[slot.0] = Some(Entry {
            virtual_id: candidate,
            real: Some(real),
        });
        Ok(candidate)
    }

    /// Real id behind a virtual id
    pub fn to_real(&self, virtual_id: NodeId) -> Option<NodeId> {
        self.slot_of(virtual_id)
            .and_then(|slot| self.slots[slot.0])
            .and_then(|e| e.real)
    }

    /// Virtual id of a real id
    pub fn to_virtual(&self, real: NodeId) -> Option<NodeId> {
        self.slots
            .iter()
            .flatten()
            .find(|e| e.real == Some(real))
            .map(|e| e.virtual_id)
    }

    /// Whether `virtual_id` belongs to this table
    pub fn contains_virtual(&self, virtual_id: NodeId) -> bool {
        self.slot_of(virtual_id).is_some()
    }

    /// Slot holding `virtual_id`
    pub fn slot_of(&self, virtual_id: NodeId) -> Option<VirtualSlot> {
        self.slots
            .iter()
            .position(|s| s.map_or(false, |e| e.virtual_id == virtual_id))
            .map(VirtualSlot)
    }

    /// Bound (virtual, real) pairs
    pub fn entries(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.slots
            .iter()
            .flatten()
            .filter_map(|e| e.real.map(|real| (e.virtual_id, real)))
    }

    /// Bound entries
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    /// No bound entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release everything except the partner reservation
    pub fn clear(&mut self) {
        let partner = self.partner_id();
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.slots[0] = Some(Entry {
            virtual_id: partner,
            real: None,
        });
    }

    fn free_slot(&self) -> Option<VirtualSlot> {
        self.slots.iter().position(Option::is_none).map(VirtualSlot)
    }
}

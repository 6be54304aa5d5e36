//! Physical and functional CAN addressing
//!
//! The table is filled once during setup and then only read. Mutation is
//! not synchronised: share it as `Arc<AddressTable>` after registration.

use std::collections::HashMap;

use crate::config::AddressingConfig;
use crate::error::{TpError, TpResult};
use crate::CanId;

/// Request/response identifier pair of one ECU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalAddressPair {
    pub ecu_name: String,
    /// Tester -> ECU
    pub request_id: CanId,
    /// ECU -> tester
    pub response_id: CanId,
}

/// Broadcast request identifiers reaching a group of ECUs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionalAddressGroup {
    ids: Vec<CanId>,
}

impl FunctionalAddressGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an identifier; duplicates are kept
    pub fn append(&mut self, request_id: CanId) {
        self.ids.push(request_id);
    }

    pub fn ids(&self) -> &[CanId] {
        &self.ids
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }

    pub fn contains(&self, id: CanId) -> bool {
        self.ids.contains(&id)
    }
}

/// Which side of a physical pair an identifier belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressRole {
    Request,
    Response,
}

/// Result of resolving a bus identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<'a> {
    Physical { ecu_name: &'a str, role: AddressRole },
    Functional,
    Unknown,
}

/// ECU addressing table
#[derive(Debug, Clone, Default)]
pub struct AddressTable {
    pairs: Vec<PhysicalAddressPair>,
    by_request: HashMap<CanId, usize>,
    by_response: HashMap<CanId, usize>,
    functional: FunctionalAddressGroup,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from parsed addressing records
    pub fn from_config(config: &AddressingConfig) -> TpResult<Self> {
        let mut table = Self::new();
        for ecu in &config.ecus {
            table.register_physical(&ecu.name, ecu.request_id, ecu.response_id)?;
        }
        for &id in &config.functional {
            table.register_functional(id);
        }
        Ok(table)
    }

    /// Register the identifier pair of an ECU
    ///
    /// Each identifier belongs to at most one pair and a non-empty name to
    /// at most one ECU. Registering an identical pair again is a no-op. On
    /// error the table is unchanged.
    pub fn register_physical(
        &mut self,
        ecu_name: &str,
        request_id: CanId,
        response_id: CanId,
    ) -> TpResult<()> {
        if request_id == response_id {
            return Err(TpError::DuplicateAddress {
                id: request_id,
                ecu: ecu_name.to_string(),
            });
        }

        if let Some(&idx) = self.by_request.get(&request_id) {
            let pair = &self.pairs[idx];
            if pair.ecu_name == ecu_name && pair.response_id == response_id {
                return Ok(());
            }
            return Err(self.duplicate(request_id, idx));
        }
        if let Some(&idx) = self.by_response.get(&request_id) {
            return Err(self.duplicate(request_id, idx));
        }
        if let Some(&idx) = self.by_request.get(&response_id) {
            return Err(self.duplicate(response_id, idx));
        }
        if let Some(&idx) = self.by_response.get(&response_id) {
            return Err(self.duplicate(response_id, idx));
        }
        if !ecu_name.is_empty() {
            if let Some(pair) = self.physical(ecu_name) {
                return Err(TpError::DuplicateAddress {
                    id: pair.request_id,
                    ecu: ecu_name.to_string(),
                });
            }
        }

        let idx = self.pairs.len();
        self.pairs.push(PhysicalAddressPair {
            ecu_name: ecu_name.to_string(),
            request_id,
            response_id,
        });
        self.by_request.insert(request_id, idx);
        self.by_response.insert(response_id, idx);

        tracing::debug!(
            ecu = ecu_name,
            request_id = format!("0x{:03X}", request_id),
            response_id = format!("0x{:03X}", response_id),
            "Registered physical address pair"
        );
        Ok(())
    }

    pub fn register_functional(&mut self, request_id: CanId) {
        self.functional.append(request_id);
    }

    pub fn resolve(&self, bus_id: CanId) -> Resolution<'_> {
        if let Some(&idx) = self.by_request.get(&bus_id) {
            return Resolution::Physical {
                ecu_name: &self.pairs[idx].ecu_name,
                role: AddressRole::Request,
            };
        }
        if let Some(&idx) = self.by_response.get(&bus_id) {
            return Resolution::Physical {
                ecu_name: &self.pairs[idx].ecu_name,
                role: AddressRole::Response,
            };
        }
        if self.functional.contains(bus_id) {
            return Resolution::Functional;
        }
        Resolution::Unknown
    }

    /// The other identifier of the physical pair containing `bus_id`
    ///
    /// Flow control for a message received on `bus_id` is sent on this id.
    pub fn counterpart(&self, bus_id: CanId) -> Option<CanId> {
        if let Some(&idx) = self.by_request.get(&bus_id) {
            return Some(self.pairs[idx].response_id);
        }
        self.by_response
            .get(&bus_id)
            .map(|&idx| self.pairs[idx].request_id)
    }

    pub fn physical(&self, ecu_name: &str) -> Option<&PhysicalAddressPair> {
        self.pairs.iter().find(|p| p.ecu_name == ecu_name)
    }

    pub fn ecus(&self) -> impl Iterator<Item = &PhysicalAddressPair> {
        self.pairs.iter()
    }

    pub fn functional(&self) -> &FunctionalAddressGroup {
        &self.functional
    }

    fn duplicate(&self, id: CanId, idx: usize) -> TpError {
        TpError::DuplicateAddress {
            id,
            ecu: self.pairs[idx].ecu_name.clone(),
        }
    }
}

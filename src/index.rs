//! Interface→service index: a sorted, rebuilt-from-scratch
//! vector of `(interface name, service slot)`, with binary-search lookup.

use crate::error::Error;
use crate::service::Service;

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    slot: usize,
}

#[derive(Debug, Default)]
pub struct InterfaceIndex {
    entries: Vec<Entry>,
}

impl InterfaceIndex {
    /// Flatten every service's interface list, sort lexicographically, then
    /// linear-scan for adjacent duplicates.
    pub fn rebuild(&mut self, services: &[Service]) -> Result<(), Error> {
        let mut entries = Vec::new();
        for (slot, service) in services.iter().enumerate() {
            for name in &service.interfaces {
                entries.push(Entry { name: name.clone(), slot });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        for pair in entries.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(Error::NotUnique(pair[0].name.clone()));
            }
        }

        self.entries = entries;
        Ok(())
    }

    /// Binary search by interface name; returns the owning service's slot.
    pub fn find(&self, interface_name: &str) -> Option<usize> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(interface_name))
            .ok()
            .map(|i| self.entries[i].slot)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }
}

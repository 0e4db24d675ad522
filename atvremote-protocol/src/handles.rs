//! Handle routing table
//!
//! Maps live host handles to the device and sub-connection that own them.
//! Host events can race resource teardown, so resolving a handle that is not
//! registered is an ordinary `None`, never an error.

use crate::host::{Handle, HandleChange, HandleKind};
use std::collections::HashMap;
use tracing::{trace, warn};

/// Owner of a live handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// 1-based device index
    pub device: usize,
    pub kind: HandleKind,
}

#[derive(Debug, Default)]
pub struct HandleTable {
    routes: HashMap<Handle, Route>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live handle
    ///
    /// Returns false if the handle was already live, in which case the old
    /// route is replaced.
    pub fn register(&mut self, handle: Handle, kind: HandleKind, device: usize) -> bool {
        let previous = self.routes.insert(handle, Route { device, kind });
        if let Some(previous) = previous {
            warn!(
                "Handle {} re-registered for device {} ({:?}) while live for device {} ({:?})",
                handle, device, kind, previous.device, previous.kind
            );
            return false;
        }
        trace!("Registered handle {} for device {} ({:?})", handle, device, kind);
        true
    }

    pub fn release(&mut self, handle: Handle) -> Option<Route> {
        let route = self.routes.remove(&handle);
        if route.is_some() {
            trace!("Released handle {}", handle);
        }
        route
    }

    pub fn resolve(&self, handle: Handle) -> Option<Route> {
        self.routes.get(&handle).copied()
    }

    /// Apply the lifecycle changes recorded during one dispatch for `device`
    pub fn apply(&mut self, device: usize, changes: Vec<HandleChange>) {
        for change in changes {
            match change {
                HandleChange::Registered(handle, kind) => {
                    self.register(handle, kind, device);
                }
                HandleChange::Released(handle) => {
                    self.release(handle);
                }
            }
        }
    }

    /// Live handles of one kind, across all devices
    pub fn count(&self, kind: HandleKind) -> usize {
        self.routes.values().filter(|r| r.kind == kind).count()
    }

    /// Live handles owned by one device
    pub fn handles_for(&self, device: usize) -> Vec<(Handle, HandleKind)> {
        let mut handles: Vec<_> = self
            .routes
            .iter()
            .filter(|(_, r)| r.device == device)
            .map(|(h, r)| (*h, r.kind))
            .collect();
        handles.sort_by_key(|(h, _)| *h);
        handles
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let mut table = HandleTable::new();
        assert!(table.register(Handle(1), HandleKind::ControlSocket, 2));
        assert_eq!(
            table.resolve(Handle(1)),
            Some(Route {
                device: 2,
                kind: HandleKind::ControlSocket
            })
        );
        assert_eq!(table.count(HandleKind::ControlSocket), 1);
    }

    #[test]
    fn test_unknown_handle_is_none() {
        let mut table = HandleTable::new();
        assert_eq!(table.resolve(Handle(42)), None);
        assert_eq!(table.release(Handle(42)), None);
    }

    #[test]
    fn test_double_register() {
        let mut table = HandleTable::new();
        assert!(table.register(Handle(5), HandleKind::PairingTimer, 1));
        assert!(!table.register(Handle(5), HandleKind::CertTimer, 3));
        assert_eq!(table.resolve(Handle(5)).unwrap().device, 3);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_apply_changes() {
        let mut table = HandleTable::new();
        table.apply(
            4,
            vec![
                HandleChange::Registered(Handle(10), HandleKind::CertSocket),
                HandleChange::Registered(Handle(11), HandleKind::CertTimer),
                HandleChange::Released(Handle(11)),
            ],
        );
        assert_eq!(table.handles_for(4), vec![(Handle(10), HandleKind::CertSocket)]);
        assert!(table.handles_for(1).is_empty());

        table.apply(4, vec![HandleChange::Released(Handle(10))]);
        assert!(table.is_empty());
    }
}

//! Roots embedded in compiled code.
//!
//! The host reports the reference slots of a method while it is being installed
//! ([`CodeCacheRoots::add_nmethod_oop`]) and then binds them to the method in one step
//! ([`CodeCacheRoots::register_nmethod`]). Slots stay roots until the method is unregistered.
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::util::Address;

thread_local! {
    static PENDING_SLOTS: RefCell<Vec<Address>> = const { RefCell::new(Vec::new()) };
}

#[derive(Default)]
struct CodeCacheTable {
    methods: HashMap<Address, Vec<Address>>,
    /// Methods whose slots were handed to the running root scan.
    scanning: HashSet<Address>,
}

#[derive(Default)]
pub struct CodeCacheRoots {
    table: Mutex<CodeCacheTable>,
}

impl CodeCacheRoots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `slot` for the next [`register_nmethod`](Self::register_nmethod) on this thread.
    pub fn add_nmethod_oop(&self, slot: Address) {
        PENDING_SLOTS.with(|pending| pending.borrow_mut().push(slot));
    }

    pub fn register_nmethod(&self, method: Address) {
        let slots = PENDING_SLOTS.with(|pending| std::mem::take(&mut *pending.borrow_mut()));
        if slots.is_empty() {
            return;
        }
        self.table
            .lock()
            .methods
            .entry(method)
            .or_default()
            .extend(slots);
    }

    pub fn unregister_nmethod(&self, method: Address) {
        let mut table = self.table.lock();
        if table.scanning.contains(&method) {
            fatal!("unregistering method {} while its roots are scanned", method);
        }
        table.methods.remove(&method);
    }

    pub fn method_count(&self) -> usize {
        self.table.lock().methods.len()
    }

    /// Snapshot every registered slot and mark their methods as scanned until
    /// [`end_scan`](Self::end_scan).
    pub fn begin_scan(&self) -> Vec<Address> {
        let mut table = self.table.lock();
        let table = &mut *table;
        table.scanning = table.methods.keys().copied().collect();
        table.methods.values().flatten().copied().collect()
    }

    pub fn end_scan(&self) {
        self.table.lock().scanning.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_slots_bind_to_the_registered_method() {
        let roots = CodeCacheRoots::new();
        roots.add_nmethod_oop(Address::from_usize(0x1000));
        roots.add_nmethod_oop(Address::from_usize(0x1008));
        roots.register_nmethod(Address::from_usize(0x40));
        roots.register_nmethod(Address::from_usize(0x80));
        assert_eq!(roots.method_count(), 1);

        let slots = roots.begin_scan();
        roots.end_scan();
        assert_eq!(slots.len(), 2);

        roots.unregister_nmethod(Address::from_usize(0x40));
        assert_eq!(roots.method_count(), 0);
        assert!(roots.begin_scan().is_empty());
        roots.end_scan();
    }

    #[test]
    fn registration_during_scan_shows_up_next_time() {
        let roots = CodeCacheRoots::new();
        roots.add_nmethod_oop(Address::from_usize(0x1000));
        roots.register_nmethod(Address::from_usize(0x40));
        assert_eq!(roots.begin_scan().len(), 1);
        roots.add_nmethod_oop(Address::from_usize(0x2000));
        roots.register_nmethod(Address::from_usize(0x80));
        roots.end_scan();
        assert_eq!(roots.begin_scan().len(), 2);
        roots.end_scan();
    }
}

use std::cell::RefCell;
use std::mem;
use std::rc::Rc;

use conduit_io::StdStreamKind;
use log::{debug, info, warn};

use crate::error::{Descriptor, IoError, Result};
use crate::object::IoObject;

/// Shared reference to a registered stream.
pub type IoHandle = Rc<RefCell<IoObject>>;

#[derive(Debug)]
enum Slot {
    /// Never used.
    Vacant,
    Open(IoHandle),
    /// Unregistered; reusable by `register`.
    Closed,
}

/// Descriptor table of one runtime context.
///
/// Descriptors 0, 1 and 2 are held in dedicated slots that exist for the whole
/// life of the table, so they can never be unregistered or go missing. Every
/// other descriptor maps into `slots` at offset 3.
#[derive(Debug)]
pub struct HandleTable {
    std: [IoHandle; 3],
    slots: Vec<Slot>,
}

impl HandleTable {
    pub(crate) fn new(stdin: IoObject, stdout: IoObject, stderr: IoObject) -> Self {
        let std = [
            (stdin, Descriptor::STDIN),
            (stdout, Descriptor::STDOUT),
            (stderr, Descriptor::STDERR),
        ]
        .map(|(mut object, descriptor)| {
            object.descriptor = Some(descriptor);
            Rc::new(RefCell::new(object))
        });
        Self {
            std,
            slots: Vec::new(),
        }
    }

    pub fn stdin(&self) -> &IoHandle {
        self.std_stream(StdStreamKind::Input)
    }

    pub fn stdout(&self) -> &IoHandle {
        self.std_stream(StdStreamKind::Output)
    }

    pub fn stderr(&self) -> &IoHandle {
        self.std_stream(StdStreamKind::Error)
    }

    pub fn std_stream(&self, kind: StdStreamKind) -> &IoHandle {
        &self.std[kind.fileno()]
    }

    /// Inserts `object` at the lowest free descriptor at or above 3.
    pub fn register(&mut self, mut object: IoObject) -> Descriptor {
        let index = self
            .slots
            .iter()
            .position(|slot| !matches!(slot, Slot::Open(_)))
            .unwrap_or(self.slots.len());
        let descriptor = Descriptor::new(index + Descriptor::FIRST_USER.get());
        object.descriptor = Some(descriptor);
        debug!("Registered {} as descriptor {}", object.name(), descriptor);

        let handle = Rc::new(RefCell::new(object));
        if index == self.slots.len() {
            self.slots.push(Slot::Open(handle));
        } else {
            self.slots[index] = Slot::Open(handle);
        }
        descriptor
    }

    /// Returns the stream registered at `descriptor`.
    ///
    /// # Errors
    /// [`IoError::NotOpen`] if the descriptor was never registered or has been
    /// unregistered.
    pub fn lookup(&self, descriptor: Descriptor) -> Result<IoHandle> {
        if descriptor.is_reserved() {
            return Ok(Rc::clone(&self.std[descriptor.get()]));
        }
        match self.slot(descriptor) {
            Some(Slot::Open(handle)) => Ok(Rc::clone(handle)),
            _ => Err(IoError::NotOpen {
                descriptor,
                op: "lookup",
            }),
        }
    }

    pub fn is_open(&self, descriptor: Descriptor) -> bool {
        descriptor.is_reserved() || matches!(self.slot(descriptor), Some(Slot::Open(_)))
    }

    /// Removes the stream at `descriptor`, freeing the descriptor for reuse.
    ///
    /// Pending output is written first; if that fails the entry stays registered.
    /// The stream is closed now if the table held the last reference, otherwise
    /// when the last outstanding handle is dropped.
    ///
    /// # Errors
    /// [`IoError::Reserved`] for 0/1/2, [`IoError::AlreadyClosed`] if the descriptor
    /// was already unregistered, [`IoError::NotOpen`] if it was never registered,
    /// [`IoError::Busy`] while the stream is borrowed through a handle.
    /// A failure while closing is reported after the descriptor has been retired.
    pub fn unregister(&mut self, descriptor: Descriptor) -> Result<()> {
        const OP: &str = "unregister";
        if descriptor.is_reserved() {
            return Err(IoError::Reserved { descriptor, op: OP });
        }
        let index = descriptor.get() - Descriptor::FIRST_USER.get();
        match self.slots.get(index) {
            Some(Slot::Open(handle)) => {
                let mut object = handle
                    .try_borrow_mut()
                    .map_err(|_| IoError::Busy { descriptor, op: OP })?;
                if !object.is_closed() {
                    object.flush_buffer(OP)?;
                }
            }
            Some(Slot::Closed) => return Err(IoError::AlreadyClosed { descriptor, op: OP }),
            Some(Slot::Vacant) | None => return Err(IoError::NotOpen { descriptor, op: OP }),
        }

        let Slot::Open(handle) = mem::replace(&mut self.slots[index], Slot::Closed) else {
            return Err(IoError::NotOpen { descriptor, op: OP });
        };
        match Rc::try_unwrap(handle) {
            Ok(cell) => {
                let mut object = cell.into_inner();
                debug!("Unregistered descriptor {} ({})", descriptor, object.name());
                if object.is_closed() {
                    Ok(())
                } else {
                    object.close()
                }
            }
            Err(shared) => {
                if let Ok(mut object) = shared.try_borrow_mut() {
                    object.descriptor = None;
                }
                debug!(
                    "Unregistered descriptor {}; release deferred to {} outstanding handle(s)",
                    descriptor,
                    Rc::strong_count(&shared) - 1
                );
                Ok(())
            }
        }
    }

    /// Live descriptors in ascending order, standard streams included.
    pub fn open_descriptors(&self) -> Vec<Descriptor> {
        let user = self.slots.iter().enumerate().filter_map(|(i, slot)| {
            matches!(slot, Slot::Open(_))
                .then(|| Descriptor::new(i + Descriptor::FIRST_USER.get()))
        });
        [Descriptor::STDIN, Descriptor::STDOUT, Descriptor::STDERR]
            .into_iter()
            .chain(user)
            .collect()
    }

    /// Number of live descriptors, standard streams included.
    pub fn len(&self) -> usize {
        self.std.len()
            + self
                .slots
                .iter()
                .filter(|slot| matches!(slot, Slot::Open(_)))
                .count()
    }

    /// Always false: the standard streams are always present.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Flushes, releases and closes every stream in descriptor order.
    ///
    /// Continues past failures and returns the first one. A stream that is
    /// borrowed at this point is skipped; it flushes when its last handle drops.
    pub(crate) fn teardown(self) -> Result<()> {
        let HandleTable { std, slots } = self;
        let standard = std
            .into_iter()
            .enumerate()
            .map(|(i, handle)| (Descriptor::new(i), handle));
        let user = slots
            .into_iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Open(handle) => {
                    Some((Descriptor::new(i + Descriptor::FIRST_USER.get()), handle))
                }
                Slot::Vacant | Slot::Closed => None,
            });

        let mut first_error = None;
        let mut count = 0;
        for (descriptor, handle) in standard.chain(user) {
            count += 1;
            let Ok(mut object) = handle.try_borrow_mut() else {
                warn!("Skipping teardown of descriptor {}: stream is borrowed", descriptor);
                continue;
            };
            if object.is_closed() {
                continue;
            }
            if let Err(e) = object.close() {
                warn!("Teardown of {} failed: {}", object.name(), e);
                first_error.get_or_insert(e);
            }
        }
        info!("Handle table torn down ({} streams)", count);
        first_error.map_or(Ok(()), Err)
    }

    fn slot(&self, descriptor: Descriptor) -> Option<&Slot> {
        descriptor
            .get()
            .checked_sub(Descriptor::FIRST_USER.get())
            .and_then(|index| self.slots.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferRole;
    use conduit_io::testing::{CloseLog, MemoryBackend, MemoryProbe};

    fn mem(name: &str, role: BufferRole) -> (IoObject, MemoryProbe) {
        let (backend, probe) = MemoryBackend::new();
        (IoObject::new(name, role, Box::new(backend)), probe)
    }

    fn table() -> HandleTable {
        HandleTable::new(
            mem("stdin", BufferRole::Read).0,
            mem("stdout", BufferRole::Write).0,
            mem("stderr", BufferRole::Write).0,
        )
    }

    #[test]
    fn standard_slots_are_present() {
        let table = table();
        for raw in 0..3 {
            let handle = table.lookup(Descriptor::new(raw)).unwrap();
            assert_eq!(handle.borrow().descriptor(), Some(Descriptor::new(raw)));
        }
        assert!(Rc::ptr_eq(
            table.stdout(),
            &table.lookup(Descriptor::STDOUT).unwrap()
        ));
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn register_starts_at_three_and_reuses_lowest() {
        let mut table = table();
        let a = table.register(mem("a", BufferRole::Both).0);
        let b = table.register(mem("b", BufferRole::Both).0);
        let c = table.register(mem("c", BufferRole::Both).0);
        assert_eq!([a.get(), b.get(), c.get()], [3, 4, 5]);

        table.unregister(b).unwrap();
        table.unregister(a).unwrap();
        assert_eq!(table.register(mem("d", BufferRole::Both).0), a);
        assert_eq!(table.register(mem("e", BufferRole::Both).0), b);
        assert_eq!(table.register(mem("f", BufferRole::Both).0).get(), 6);
    }

    #[test]
    fn double_unregister_is_already_closed() {
        let mut table = table();
        let d = table.register(mem("file", BufferRole::Both).0);
        table.unregister(d).unwrap();
        assert!(matches!(
            table.unregister(d),
            Err(IoError::AlreadyClosed { descriptor, op: "unregister" }) if descriptor == d
        ));
        assert!(matches!(table.lookup(d), Err(IoError::NotOpen { .. })));
    }

    #[test]
    fn unknown_and_reserved_descriptors() {
        let mut table = table();
        assert!(matches!(
            table.lookup(Descriptor::new(9)),
            Err(IoError::NotOpen { .. })
        ));
        assert!(matches!(
            table.unregister(Descriptor::new(9)),
            Err(IoError::NotOpen { .. })
        ));
        assert!(matches!(
            table.unregister(Descriptor::STDERR),
            Err(IoError::Reserved { .. })
        ));
        assert!(table.is_open(Descriptor::STDERR));
    }

    #[test]
    fn unregister_closes_sole_owner() {
        let mut table = table();
        let (object, probe) = mem("file", BufferRole::Write);
        let d = table.register(object);
        table.lookup(d).unwrap().borrow_mut().write(b"data").unwrap();
        table.unregister(d).unwrap();
        assert_eq!(probe.contents(), b"data");
        assert_eq!(probe.close_calls(), 1);
    }

    #[test]
    fn unregister_defers_close_to_outstanding_handles() {
        let mut table = table();
        let (object, probe) = mem("file", BufferRole::Write);
        let d = table.register(object);
        let held = table.lookup(d).unwrap();
        table.unregister(d).unwrap();

        assert_eq!(probe.close_calls(), 0);
        assert_eq!(held.borrow().descriptor(), None);
        held.borrow_mut().write(b"still usable").unwrap();
        drop(held);
        assert_eq!(probe.contents(), b"still usable");
    }

    #[test]
    fn failed_flush_keeps_entry_registered() {
        let mut table = table();
        let (object, probe) = mem("file", BufferRole::Write);
        let d = table.register(object);
        table.lookup(d).unwrap().borrow_mut().write(b"x").unwrap();
        probe.set_fail_writes(true);
        assert!(table.unregister(d).unwrap_err().is_backend());
        assert!(table.is_open(d));

        probe.set_fail_writes(false);
        table.unregister(d).unwrap();
        assert!(!table.is_open(d));
    }

    #[test]
    fn open_descriptors_are_ordered() {
        let mut table = table();
        let a = table.register(mem("a", BufferRole::Read).0);
        let b = table.register(mem("b", BufferRole::Read).0);
        table.unregister(a).unwrap();
        assert_eq!(
            table.open_descriptors(),
            vec![
                Descriptor::STDIN,
                Descriptor::STDOUT,
                Descriptor::STDERR,
                b
            ]
        );
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn teardown_closes_everything() {
        let (stdin, p0) = mem("stdin", BufferRole::Read);
        let (stdout, p1) = mem("stdout", BufferRole::Write);
        let (stderr, p2) = mem("stderr", BufferRole::Write);
        let mut table = HandleTable::new(stdin, stdout, stderr);
        let (file, p3) = mem("file", BufferRole::Write);
        let d = table.register(file);
        table.lookup(d).unwrap().borrow_mut().write(b"tail").unwrap();
        table.stdout().borrow_mut().write(b"out").unwrap();

        table.teardown().unwrap();
        for probe in [&p0, &p1, &p2, &p3] {
            assert_eq!(probe.close_calls(), 1);
        }
        assert_eq!(p1.contents(), b"out");
        assert_eq!(p3.contents(), b"tail");
    }

    #[test]
    fn teardown_closes_in_ascending_descriptor_order() {
        let log = CloseLog::default();
        let logged = |name: &str, role| {
            let (backend, _) = MemoryBackend::new();
            IoObject::new(name, role, Box::new(backend.logging_closes(&log, name)))
        };
        let mut table = HandleTable::new(
            logged("stdin", BufferRole::Read),
            logged("stdout", BufferRole::Write),
            logged("stderr", BufferRole::Write),
        );
        let a = table.register(logged("a", BufferRole::Both));
        table.register(logged("b", BufferRole::Both));
        table.register(logged("c", BufferRole::Both));
        table.unregister(a).unwrap();
        // Reuses descriptor 3, ahead of b and c.
        table.register(logged("d", BufferRole::Both));

        table.teardown().unwrap();
        assert_eq!(
            log.entries(),
            ["a", "stdin", "stdout", "stderr", "d", "b", "c"]
        );
    }

    #[test]
    fn unregister_while_borrowed_is_busy() {
        let mut table = table();
        let (object, backend_state) = mem("file", BufferRole::Write);
        let d = table.register(object);
        let held = table.lookup(d).unwrap();
        let guard = held.borrow();

        assert!(matches!(
            table.unregister(d),
            Err(IoError::Busy { descriptor, op: "unregister" }) if descriptor == d
        ));
        assert!(table.is_open(d));
        assert_eq!(backend_state.close_calls(), 0);

        drop(guard);
        drop(held);
        table.unregister(d).unwrap();
        assert_eq!(backend_state.close_calls(), 1);
    }

    #[test]
    fn teardown_skips_borrowed_streams() {
        let mut table = table();
        let (busy, busy_state) = mem("busy", BufferRole::Write);
        let (idle, idle_state) = mem("idle", BufferRole::Write);
        let d = table.register(busy);
        table.register(idle);
        let held = table.lookup(d).unwrap();
        held.borrow_mut().write(b"later").unwrap();

        {
            let _guard = held.borrow();
            table.teardown().unwrap();
        }
        assert_eq!(idle_state.close_calls(), 1);
        assert_eq!(busy_state.close_calls(), 0);

        drop(held);
        assert_eq!(busy_state.contents(), b"later");
    }
}

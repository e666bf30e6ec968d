use std::collections::BTreeSet;
use std::rc::Rc;

use conduit_core::{BufferRole, ContextConfig, Descriptor, IoContext, IoError, StdBackends};
use conduit_io::testing::MemoryBackend;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Register,
    Unregister(usize),
    Lookup(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Register),
        2 => (0usize..12).prop_map(Op::Unregister),
        1 => (0usize..12).prop_map(Op::Lookup),
    ]
}

fn context() -> IoContext {
    let mut ctx = IoContext::new(ContextConfig::default());
    let (i, _) = MemoryBackend::new();
    let (o, _) = MemoryBackend::new();
    let (e, _) = MemoryBackend::new();
    ctx.initialize_with(StdBackends {
        stdin: Box::new(i),
        stdout: Box::new(o),
        stderr: Box::new(e),
    })
    .unwrap();
    ctx
}

proptest! {
    #[test]
    fn table_matches_a_lowest_free_model(ops in prop::collection::vec(op(), 1..64)) {
        let mut ctx = context();
        let mut open: BTreeSet<usize> = BTreeSet::new();
        let mut retired: BTreeSet<usize> = BTreeSet::new();

        for op in ops {
            match op {
                Op::Register => {
                    let expected = (3..).find(|d| !open.contains(d)).unwrap();
                    let (backend, _) = MemoryBackend::new();
                    let object = ctx.object("p", BufferRole::Both, Box::new(backend));
                    let d = ctx.register(object).unwrap();
                    prop_assert_eq!(d.get(), expected);
                    open.insert(expected);
                    retired.remove(&expected);
                }
                Op::Unregister(raw) => {
                    let result = ctx.unregister(Descriptor::new(raw));
                    if raw < 3 {
                        let is_reserved = matches!(result, Err(IoError::Reserved { .. }));
                        prop_assert!(is_reserved);
                    } else if open.remove(&raw) {
                        prop_assert!(result.is_ok());
                        retired.insert(raw);
                    } else if retired.contains(&raw) {
                        let is_closed = matches!(result, Err(IoError::AlreadyClosed { .. }));
                        prop_assert!(is_closed);
                    } else {
                        let is_not_open = matches!(result, Err(IoError::NotOpen { .. }));
                        prop_assert!(is_not_open);
                    }
                }
                Op::Lookup(raw) => {
                    let d = Descriptor::new(raw);
                    match ctx.lookup(d) {
                        Ok(handle) => {
                            prop_assert!(raw < 3 || open.contains(&raw));
                            prop_assert_eq!(handle.borrow().descriptor(), Some(d));
                            prop_assert!(Rc::ptr_eq(&handle, &ctx.lookup(d).unwrap()));
                        }
                        Err(err) => {
                            prop_assert!(raw >= 3 && !open.contains(&raw));
                            let is_not_open = matches!(err, IoError::NotOpen { .. });
                            prop_assert!(is_not_open);
                        }
                    }
                }
            }
        }

        let table = ctx.table().unwrap();
        prop_assert_eq!(table.len(), 3 + open.len());
        let live: Vec<usize> = table.open_descriptors().iter().map(|d| d.get()).collect();
        let expected: Vec<usize> = (0..3).chain(open.iter().copied()).collect();
        prop_assert_eq!(live, expected);
    }
}

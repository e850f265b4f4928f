#![cfg(test)]

// Property tests for ThreadMap kept inside the crate: they drive the table
// directly with fixed-identifier handles, which needs crate-private access.

use crate::handle::Handle;
use crate::thread_map::ThreadMap;
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Clone, Debug)]
enum Op {
    Set(usize, i32),
    Get(usize),
    Remove(usize),
    // Drop the only strong reference, turning the handle's entry stale.
    DropHandle(usize),
}

// Identifiers collide heavily on purpose: four home slots at the initial
// table length, shared by up to six handles each.
fn raw_id(i: usize) -> u32 {
    ((i % 4) * 4 + (i / 4) * 16) as u32
}

fn arb_scenario() -> impl Strategy<Value = (usize, Vec<Op>)> {
    (1usize..=24).prop_flat_map(|pool| {
        let idx = 0..pool;
        let op = prop_oneof![
            (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Set(i, v)),
            idx.clone().prop_map(Op::Get),
            idx.clone().prop_map(Op::Remove),
            idx.clone().prop_map(Op::DropHandle),
        ];
        proptest::collection::vec(op, 1..200).prop_map(move |ops| (pool, ops))
    })
}

// Property: state-machine equivalence against std::collections::HashMap,
// with the structural invariants re-checked after every step:
// - `get`/`set`/`remove` parity with the model for every live handle.
// - Dropping a handle eventually evicts its binding; it never resurfaces
//   under a later handle, collisions or not.
// - Table length stays a power of two, size counts occupied slots, and
//   every live entry stays reachable by probing from its home slot.
proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        let mut handles: Vec<Option<Handle<i32>>> =
            (0..pool).map(|i| Some(Handle::with_raw_id(raw_id(i)))).collect();
        let mut map: Option<ThreadMap> = None;
        let mut model: HashMap<usize, i32> = HashMap::new();

        for op in ops {
            match op {
                Op::Set(i, v) => {
                    let Some(h) = &handles[i] else { continue };
                    let slot = &mut map;
                    match slot {
                        Some(m) => m.set(&h.erased(), Box::new(v)),
                        None => *slot = Some(ThreadMap::new(&h.erased(), Box::new(v))),
                    }
                    model.insert(i, v);
                }
                Op::Get(i) => {
                    let Some(h) = &handles[i] else { continue };
                    let got = map
                        .as_mut()
                        .and_then(|m| m.get(&h.erased()))
                        .map(|v| *v.downcast_ref::<i32>().expect("values are i32"));
                    prop_assert_eq!(got, model.get(&i).copied());
                }
                Op::Remove(i) => {
                    let Some(h) = &handles[i] else { continue };
                    if let Some(m) = &mut map {
                        m.remove(&h.erased());
                    }
                    model.remove(&i);
                }
                Op::DropHandle(i) => {
                    handles[i] = None;
                    model.remove(&i);
                }
            }
            if let Some(m) = &map {
                m.check_invariants();
            }
        }

        // Final parity sweep over every handle that survived.
        for (i, h) in handles.iter().enumerate() {
            let Some(h) = h else { continue };
            let got = map
                .as_mut()
                .and_then(|m| m.get(&h.erased()))
                .map(|v| *v.downcast_ref::<i32>().expect("values are i32"));
            prop_assert_eq!(got, model.get(&i).copied());
        }
    }
}

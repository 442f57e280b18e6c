use std::collections::HashSet;
use std::io::Write;
use std::os::fd::AsRawFd;

use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

use crate::{CompletionPolicy, IoOpcode, IoQueue, IoVec, SimAio, SlotId};

#[derive(Debug, Clone)]
enum Op {
    Enqueue,
    Submit,
    Complete,
    Poll,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Enqueue),
        2 => Just(Op::Submit),
        2 => Just(Op::Complete),
        2 => Just(Op::Poll),
    ]
}

fn check(capacity: usize, ops: &[Op]) -> TestCaseResult {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&vec![0xa5u8; 4096]).unwrap();

    let sim = SimAio::new(CompletionPolicy::Manual);
    let mut q: IoQueue<usize> = IoQueue::initialize(file.as_raw_fd(), capacity, &sim).unwrap();
    let mut bufs = vec![[0u8; 16]; capacity];

    let mut outstanding: HashSet<SlotId> = HashSet::new();
    let mut next_tag = 0usize;

    for op in ops {
        match op {
            Op::Enqueue => {
                if q.free_count() == 0 {
                    continue;
                }
                let slot_hint = q.capacity() - q.free_count();
                let buf = &mut bufs[slot_hint % capacity];
                let iov = IoVec {
                    base: buf.as_mut_ptr(),
                    len: buf.len(),
                };
                let id = q.enqueue_rdwr(IoOpcode::Readv, &[iov], 0, next_tag);
                next_tag += 1;
                prop_assert!(outstanding.insert(id), "slot {:?} handed out twice", id);
            }
            Op::Submit => {
                q.submit_batch().unwrap();
            }
            Op::Complete => {
                sim.complete_next();
            }
            Op::Poll => {
                let mut released = Vec::new();
                q.poll_completions(|id, res, _| {
                    released.push((id, res));
                })
                .unwrap();
                for (id, res) in released {
                    prop_assert_eq!(res, 16);
                    prop_assert!(outstanding.remove(&id), "slot {:?} was not outstanding", id);
                }
            }
        }
        prop_assert_eq!(q.free_count() + outstanding.len(), capacity);
        prop_assert_eq!(q.in_flight(), outstanding.len());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn free_plus_outstanding_is_constant(
        capacity in 1usize..8,
        ops in prop::collection::vec(op_strategy(), 1..80),
    ) {
        check(capacity, &ops)?;
    }
}

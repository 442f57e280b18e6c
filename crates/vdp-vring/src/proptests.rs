use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;
use proptest::sample::Index;
use proptest::test_runner::TestCaseResult;
use vdp_mem::GuestRam;

use crate::{GuestBuf, GuestDriver, Pop, QueueLayout, RingFeatures, Vring};

const RING_BASE: u64 = 0x1000;
const DATA_BASE: u64 = 0x10_000;

#[derive(Debug, Clone)]
struct Round {
    add: usize,
    pop: usize,
    push: Vec<Index>,
}

fn round_strategy() -> impl Strategy<Value = Round> {
    (0usize..10, 0usize..10, prop::collection::vec(any::<Index>(), 0..10))
        .prop_map(|(add, pop, push)| Round { add, pop, push })
}

fn run_rounds(size: u16, event_idx: bool, rounds: &[Round]) -> TestCaseResult {
    let mem = Arc::new(GuestRam::new(0x20_000).unwrap());
    let layout = QueueLayout::contiguous(RING_BASE, size);
    let mut guest = GuestDriver::new(mem.clone(), layout).unwrap();
    let features = if event_idx {
        RingFeatures::EVENT_IDX.bits()
    } else {
        0
    };
    let mut ring = Vring::set_up(mem, &layout.queue_state(), features, 16).unwrap();

    let mut popped: Vec<u16> = Vec::new();
    let mut pushed_not_reaped: HashSet<u32> = HashSet::new();
    let mut pushes = 0u16;

    for round in rounds {
        for _ in 0..round.add {
            let i = u64::from(guest.avail_idx());
            let buf = GuestBuf::writable(DATA_BASE + (i % 64) * 16, 16);
            if guest.add_chain(&[buf]).unwrap().is_none() {
                break;
            }
        }
        guest.publish().unwrap();

        for _ in 0..round.pop {
            match ring.pop(usize::MAX).unwrap() {
                Pop::Element(elem) => {
                    prop_assert!(!popped.contains(&elem.head));
                    popped.push(elem.head);
                }
                Pop::Empty => break,
                Pop::Exhausted => prop_assert!(false, "unbounded pop reported exhaustion"),
            }
        }

        for pick in &round.push {
            if popped.is_empty() {
                break;
            }
            let head = popped.swap_remove(pick.index(popped.len()));
            ring.push(head, 16);
            pushes = pushes.wrapping_add(1);
            prop_assert!(pushed_not_reaped.insert(u32::from(head)));
        }

        prop_assert_eq!(guest.used_idx().unwrap(), pushes);
        prop_assert_eq!(ring.last_used_idx(), pushes);

        for used in guest.drain_used().unwrap() {
            prop_assert!(
                pushed_not_reaped.remove(&used.id),
                "used element {} was never pushed",
                used.id
            );
            prop_assert_eq!(used.len, 16);
        }
        prop_assert!(pushed_not_reaped.is_empty());
        prop_assert!(!ring.is_broken());
    }

    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn used_ring_reports_each_popped_head_exactly_once(
        size in prop_oneof![Just(2u16), Just(4u16), Just(8u16), Just(16u16)],
        event_idx in any::<bool>(),
        rounds in prop::collection::vec(round_strategy(), 1..24),
    ) {
        run_rounds(size, event_idx, &rounds)?;
    }
}

use crate::ring::Ring;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Produce,
    Consume,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![3 => Just(Op::Produce), 2 => Just(Op::Consume)]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn ring_occupancy_never_exceeds_capacity(
        elements in 2usize..64,
        ops in proptest::collection::vec(op_strategy(), 0..512),
    ) {
        let ring = Ring::new(0x10_0000, elements, 0);
        let mut model = 0usize;

        for op in ops {
            match op {
                Op::Produce => {
                    let full = ring.is_full();
                    prop_assert_eq!(full, model == elements - 1);
                    if !full {
                        ring.advance_write();
                        model += 1;
                    }
                }
                Op::Consume => {
                    if !ring.is_empty() {
                        ring.advance_read();
                        model -= 1;
                    }
                }
            }

            prop_assert!(ring.occupied() <= elements - 1);
            prop_assert_eq!(ring.occupied(), model);
            prop_assert_eq!(ring.slots_available() + ring.occupied(), elements - 1);
            prop_assert_eq!(ring.is_full(), ring.slots_available() == 0);
            prop_assert!(ring.wp() < elements && ring.rp() < elements);
        }
    }

    #[test]
    fn to_local_inverts_to_device(elements in 2usize..256, idx in 0usize..256) {
        let ring = Ring::new(0x4000_0000, elements, 0);
        let idx = idx % elements;
        prop_assert_eq!(ring.to_local(ring.to_device(idx)), Some(idx));
    }
}

//! Property tests for the bit set laws the liveness code relies on.

use basil_common::Bitset;
use proptest::prelude::*;

fn build(bits: &[usize]) -> Bitset {
    let mut bs = Bitset::new();
    for &b in bits {
        bs.set(b).expect("set");
    }
    bs
}

proptest! {
    #[test]
    fn union_then_intersect_absorbs(
        a in prop::collection::vec(0usize..256, 0..32),
        b in prop::collection::vec(0usize..256, 0..32),
    ) {
        // (A | B) & B == B
        let sa = build(&a);
        let sb = build(&b);
        let mut u = sa.clone();
        u.or(&sb).unwrap();
        u.and(&sb);
        prop_assert_eq!(u.values(), sb.values());
    }

    #[test]
    fn self_difference_is_empty(a in prop::collection::vec(0usize..256, 0..32)) {
        let sa = build(&a);
        let mut d = sa.clone();
        d.sub(&sa);
        prop_assert!(d.is_empty());
        prop_assert_eq!(d.count(), 0);
    }

    #[test]
    fn count_equals_values_len(a in prop::collection::vec(0usize..256, 0..32)) {
        let sa = build(&a);
        prop_assert_eq!(sa.count(), sa.values().len());
    }

    #[test]
    fn double_invert_is_identity(a in prop::collection::vec(0usize..256, 0..32)) {
        let sa = build(&a);
        let mut i = sa.clone();
        i.invert();
        i.invert();
        prop_assert_eq!(i.values(), sa.values());
    }

    #[test]
    fn unset_removes_only_member(
        a in prop::collection::vec(0usize..256, 1..32),
        idx in 0usize..32,
    ) {
        let sa = build(&a);
        let victim = a[idx % a.len()];
        let mut s = sa.clone();
        s.unset(victim);
        prop_assert!(!s.contains(victim));
        for v in sa.values() {
            if v != victim {
                prop_assert!(s.contains(v));
            }
        }
    }
}

//! Property-based tests for room identity derivation.
//!
//! Uses proptest to verify:
//! 1. Derivation is commutative for any pair of non-empty identifiers.
//! 2. The digest never equals either input identifier.
//! 3. Distinct pairs that a separator join would conflate stay distinct.
//! 4. Empty identifiers are always rejected.

use pairchat_proto::room::{self, RoomIdError};
use proptest::prelude::*;

/// Strategy for non-empty participant identifiers, including the `$`
/// character that broke naive separator joins.
fn arb_participant() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9$_\\-]{1,32}"
}

proptest! {
    #[test]
    fn derivation_is_commutative(a in arb_participant(), b in arb_participant()) {
        let ab = room::derive(&a, &b).unwrap();
        let ba = room::derive(&b, &a).unwrap();
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn digest_differs_from_inputs(a in arb_participant(), b in arb_participant()) {
        prop_assume!(a != b);
        let id = room::derive(&a, &b).unwrap();
        prop_assert_ne!(id.as_str(), a.as_str());
        prop_assert_ne!(id.as_str(), b.as_str());
    }

    #[test]
    fn split_point_changes_the_room(
        left in "[a-z]{1,8}",
        middle in "[a-z]{1,8}",
        right in "[a-z]{1,8}",
    ) {
        // ("L$M", "R") and ("L", "M$R") collide under a "$" join. They are
        // the same unordered pair only when all three parts are equal.
        prop_assume!(!(left == middle && middle == right));
        let first = room::derive(&format!("{left}${middle}"), &right).unwrap();
        let second = room::derive(&left, &format!("{middle}${right}")).unwrap();
        prop_assert_ne!(first, second);
    }

    #[test]
    fn empty_side_is_rejected(a in arb_participant()) {
        prop_assert!(matches!(room::derive(&a, ""), Err(RoomIdError::InvalidInput(_))));
        prop_assert!(matches!(room::derive("", &a), Err(RoomIdError::InvalidInput(_))));
    }

    #[test]
    fn arbitrary_unicode_never_panics(a in "\\PC{1,16}", b in "\\PC{1,16}") {
        let ab = room::derive(&a, &b).unwrap();
        prop_assert_eq!(ab.as_str().len(), 64);
    }
}

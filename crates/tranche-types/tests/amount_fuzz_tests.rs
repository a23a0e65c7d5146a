use proptest::prelude::*;
use tranche_types::{TokenUnits, UsdAmount};

prop_compose! {
    fn arb_usd_amount()
        (cents in 0u64..=10_000_000_000_00u64) -> UsdAmount {
        UsdAmount::from_cents(cents)
    }
}

proptest! {
    // Converting a human amount to smallest units and back must be exact
    // for every token precision of at least two decimals.
    #[test]
    fn conversion_round_trip_is_exact(amount in arb_usd_amount(), decimals in 2u8..=18) {
        let units = amount.to_token_units(decimals).unwrap();
        prop_assert_eq!(units.to_usd(decimals), Some(amount));
    }

    #[test]
    fn conversion_scales_by_power_of_ten(amount in arb_usd_amount(), decimals in 2u8..=18) {
        let units = amount.to_token_units(decimals).unwrap();
        let scale = 10u128.pow(decimals as u32 - 2);
        prop_assert_eq!(units.raw(), amount.to_cents() as u128 * scale);
    }

    #[test]
    fn display_parse_round_trip(amount in arb_usd_amount()) {
        let printed = amount.to_string();
        prop_assert_eq!(printed.parse::<UsdAmount>().unwrap(), amount);
    }

    #[test]
    fn sub_cent_units_never_round(raw in 1u128..1_000_000) {
        // Any unit count that is not a whole multiple of a cent must be
        // rejected rather than rounded.
        let decimals = 8u8;
        let scale = 10u128.pow(6);
        if raw % scale != 0 {
            prop_assert_eq!(TokenUnits::from_raw(raw).to_usd(decimals), None);
        }
    }
}

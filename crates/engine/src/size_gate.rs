//! Size Gate Module
//!
//! Post-encode check deciding whether a finished output is worth keeping.

use serde::{Deserialize, Serialize};

/// Result of the size gate check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeGateResult {
    /// Output is kept
    Accept,
    /// Output is below the minimum viable size
    TooSmall { output_bytes: u64, min_bytes: u64 },
    /// Output is not smaller than the source
    Regressed { input_bytes: u64, output_bytes: u64 },
}

/// What the gate needs to know besides the two sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeGateRules {
    pub min_output_bytes: u64,
    /// A resize changes what the output is, so growth is accepted.
    pub resized: bool,
    pub force_convert: bool,
}

/// Classifies an output of `output_bytes` made from a source of `input_bytes`.
///
/// The minimum-size floor is checked first. Growth only counts as a
/// regression when neither a resize nor a forced conversion was asked for.
pub fn check_size_gate(input_bytes: u64, output_bytes: u64, rules: &SizeGateRules) -> SizeGateResult {
    if output_bytes < rules.min_output_bytes {
        return SizeGateResult::TooSmall {
            output_bytes,
            min_bytes: rules.min_output_bytes,
        };
    }

    if output_bytes >= input_bytes && !rules.resized && !rules.force_convert {
        return SizeGateResult::Regressed {
            input_bytes,
            output_bytes,
        };
    }

    SizeGateResult::Accept
}

/// Bytes saved by keeping the output; zero when it grew.
pub fn bytes_saved(input_bytes: u64, output_bytes: u64) -> u64 {
    input_bytes.saturating_sub(output_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;

    fn rules() -> SizeGateRules {
        SizeGateRules {
            min_output_bytes: 100 * 1024,
            resized: false,
            force_convert: false,
        }
    }

    #[test]
    fn test_larger_output_regresses() {
        assert_eq!(
            check_size_gate(100 * MB, 120 * MB, &rules()),
            SizeGateResult::Regressed {
                input_bytes: 100 * MB,
                output_bytes: 120 * MB,
            }
        );
    }

    #[test]
    fn test_equal_size_regresses() {
        assert!(matches!(
            check_size_gate(50 * MB, 50 * MB, &rules()),
            SizeGateResult::Regressed { .. }
        ));
    }

    #[test]
    fn test_resize_or_force_accepts_growth() {
        let resized = SizeGateRules {
            resized: true,
            ..rules()
        };
        assert_eq!(check_size_gate(100 * MB, 120 * MB, &resized), SizeGateResult::Accept);

        let forced = SizeGateRules {
            force_convert: true,
            ..rules()
        };
        assert_eq!(check_size_gate(100 * MB, 120 * MB, &forced), SizeGateResult::Accept);
    }

    #[test]
    fn test_floor_wins_over_everything() {
        let forced = SizeGateRules {
            force_convert: true,
            ..rules()
        };
        assert_eq!(
            check_size_gate(100 * MB, 1024, &forced),
            SizeGateResult::TooSmall {
                output_bytes: 1024,
                min_bytes: 100 * 1024,
            }
        );
        // exactly at the floor is viable
        assert_eq!(check_size_gate(100 * MB, 100 * 1024, &rules()), SizeGateResult::Accept);
    }

    #[test]
    fn test_bytes_saved() {
        assert_eq!(bytes_saved(100, 40), 60);
        assert_eq!(bytes_saved(40, 100), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_size_gate_classification(
            input_bytes in 0u64..=u64::MAX / 2,
            output_bytes in 0u64..=u64::MAX / 2,
            min_output_bytes in 0u64..=10 * MB,
            resized in any::<bool>(),
            force_convert in any::<bool>(),
        ) {
            let rules = SizeGateRules { min_output_bytes, resized, force_convert };
            match check_size_gate(input_bytes, output_bytes, &rules) {
                SizeGateResult::TooSmall { output_bytes: out, min_bytes } => {
                    prop_assert!(out < min_bytes);
                    prop_assert_eq!(out, output_bytes);
                }
                SizeGateResult::Regressed { input_bytes: inp, output_bytes: out } => {
                    prop_assert!(out >= min_output_bytes);
                    prop_assert!(out >= inp);
                    prop_assert!(!resized && !force_convert);
                }
                SizeGateResult::Accept => {
                    prop_assert!(output_bytes >= min_output_bytes);
                    prop_assert!(output_bytes < input_bytes || resized || force_convert);
                }
            }
        }
    }
}

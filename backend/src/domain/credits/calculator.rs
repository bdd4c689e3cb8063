//! Pricing for synthesis requests.

/// Credits required to synthesize `text` with the given unit size.
///
/// Length is counted in Unicode codepoints, not bytes, so multilingual text
/// prices the same as ASCII of equal length. Every non-empty or empty text
/// costs at least one credit.
///
/// ```
/// use backend::domain::credits::required_credits;
///
/// assert_eq!(required_credits("", 1000), 1);
/// assert_eq!(required_credits(&"a".repeat(2500), 1000), 3);
/// ```
pub fn required_credits(text: &str, unit_size: u32) -> i64 {
    debug_assert!(unit_size > 0, "unit_size is validated at configuration load");
    let unit = u64::from(unit_size.max(1));
    let chars = text.chars().count() as u64;
    (chars.div_ceil(unit)).max(1) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", 1000, 1)]
    #[case::one_char("a", 1000, 1)]
    #[case::exact_unit(&"a".repeat(1000), 1000, 1)]
    #[case::one_over(&"a".repeat(1001), 1000, 2)]
    #[case::several_units(&"a".repeat(2500), 1000, 3)]
    #[case::small_unit("abcd", 2, 2)]
    fn prices_by_codepoint_count(#[case] text: &str, #[case] unit: u32, #[case] expected: i64) {
        assert_eq!(required_credits(text, unit), expected);
    }

    #[rstest]
    fn multibyte_text_counts_codepoints_not_bytes() {
        // 1001 three-byte codepoints: two units, not ceil(3003 / 1000).
        let text = "猫".repeat(1001);
        assert_eq!(required_credits(&text, 1000), 2);
    }
}

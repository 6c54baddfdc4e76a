use crate::error::PipelineError;

/// Normalize a tax identifier to canonical `XX-XXXXXXX` form.
///
/// Accepts the 9-digit core with or without the dash and with surrounding
/// whitespace. Anything that does not reduce to exactly 9 digits is rejected.
pub fn normalize_ein(raw: &str) -> Result<String, PipelineError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let stripped: String = raw.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();

    if digits.len() != 9 || stripped.len() != digits.len() {
        return Err(PipelineError::InvalidEin(format!(
            "{raw}: expected 9 digits (XX-XXXXXXX)"
        )));
    }

    Ok(format!("{}-{}", &digits[..2], &digits[2..]))
}

/// Strip an EIN to its 9-digit core for comparisons.
pub fn ein_digits(ein: &str) -> String {
    ein.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// True when two identifiers refer to the same organization regardless of
/// formatting.
pub fn ein_matches(a: &str, b: &str) -> bool {
    let da = ein_digits(a);
    !da.is_empty() && da == ein_digits(b)
}

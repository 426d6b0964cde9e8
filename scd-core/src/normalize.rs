// Values the upstream extraction uses to mean "no value". Comparison is exact after trimming.
const NULL_MARKERS: &[&str] = &["null", "NULL", "None"];

/// Normalizes an attribute value for comparison and storage. Whitespace is trimmed, and empty
/// strings or null markers become absent. Applied identically to incoming snapshots, stored
/// versions and allow-lists, so two values compare equal iff their normalized forms do.
pub fn normalize_value(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() || NULL_MARKERS.contains(&trimmed) {
        return None;
    }
    Some(trimmed.to_string())
}

pub fn normalize_values(values: &[Option<String>]) -> Vec<Option<String>> {
    values
        .iter()
        .map(|v| normalize_value(v.as_deref()))
        .collect()
}

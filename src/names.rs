use crate::error::{PsErr, Result};

/// Whether `name` is a dot separated path of identifiers, like `encoder.layers.0_fc.weight`.
///
/// Each segment must start with an ascii letter or an underscore followed by ascii
/// alphanumerics or underscores. Child segments may also be purely numeric, the way graph
/// containers name their children by position, the first segment may not.
pub fn is_valid_qualified_name(name: &str) -> bool {
    let mut segments = name.split('.');

    match segments.next() {
        Some(first) if !first.starts_with(|c: char| c.is_ascii_digit()) => {
            is_valid_segment(first) && segments.all(is_valid_segment)
        }
        _ => false,
    }
}

fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();

    match chars.next() {
        Some(c) if c.is_ascii_digit() => segment.chars().all(|c| c.is_ascii_digit()),
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Trims `name` and checks it's a valid qualified name.
///
/// # Arguments
/// * `name` - The candidate name.
///
/// # Returns
/// The trimmed name or an `InvalidName` error.
pub fn checked_qualified_name(name: &str) -> Result<String> {
    let name = name.trim();

    if !is_valid_qualified_name(name) {
        return Err(PsErr::InvalidName {
            name: name.to_string(),
        });
    }

    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_graph_paths() {
        assert!(is_valid_qualified_name("fc"));
        assert!(is_valid_qualified_name("encoder.layers.0.weight"));
        assert!(is_valid_qualified_name("_sparse.embedding_1"));
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(!is_valid_qualified_name(""));
        assert!(!is_valid_qualified_name("fc..weight"));
        assert!(!is_valid_qualified_name("fc.weight."));
        assert!(!is_valid_qualified_name("1fc"));
        assert!(!is_valid_qualified_name("fc/weight"));
    }

    #[test]
    fn numeric_segments_only_name_children() {
        assert!(is_valid_qualified_name("layers.0"));
        assert!(!is_valid_qualified_name("0"));
        assert!(!is_valid_qualified_name("0.weight"));
        assert!(checked_qualified_name(" 42 ").is_err());
    }

    #[test]
    fn trims_before_checking() {
        assert_eq!(checked_qualified_name("  ctr_v1 ").unwrap(), "ctr_v1");
        assert!(checked_qualified_name("ctr v1").is_err());
    }
}

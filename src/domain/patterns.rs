//! File-name patterns with a single `{name}` wildcard.
//!
//! Streaming plugins watch a directory for files such as
//! `{micrograph}.mrc` and derive one step per match, substituting the
//! captured value into the step's command and outputs.

/// Checks if a string contains wildcard syntax.
pub fn has_wildcards(text: &str) -> bool {
    text.contains('{') && text.contains('}')
}

/// Extracts wildcard names from a pattern.
///
/// # Example
/// ```
/// use protoflow::domain::patterns::extract_wildcard_names;
///
/// let names = extract_wildcard_names("movies/{movie}.tif");
/// assert_eq!(names, vec!["movie"]);
/// ```
pub fn extract_wildcard_names(pattern: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut in_wildcard = false;
    let mut current_name = String::new();

    for ch in pattern.chars() {
        match ch {
            '{' => {
                in_wildcard = true;
                current_name.clear();
            }
            '}' => {
                if in_wildcard && !current_name.is_empty() {
                    names.push(current_name.clone());
                    current_name.clear();
                }
                in_wildcard = false;
            }
            _ => {
                if in_wildcard {
                    current_name.push(ch);
                }
            }
        }
    }

    names
}

/// Substitutes a wildcard in a string with a concrete value.
pub fn substitute_wildcard(text: &str, wildcard_name: &str, value: &str) -> String {
    text.replace(&format!("{{{}}}", wildcard_name), value)
}

/// Matches a file name against a single-wildcard pattern and returns the
/// captured value.
///
/// The pattern must contain exactly one wildcard; the captured value is
/// never empty.
///
/// # Example
/// ```
/// use protoflow::domain::patterns::match_pattern;
///
/// assert_eq!(match_pattern("{movie}.tif", "mic_001.tif"), Some("mic_001".to_string()));
/// assert_eq!(match_pattern("{movie}.tif", "mic_001.mrc"), None);
/// ```
pub fn match_pattern(pattern: &str, file_name: &str) -> Option<String> {
    let open = pattern.find('{')?;
    let close = open + pattern[open..].find('}')?;
    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];
    if has_wildcards(suffix) {
        return None;
    }

    let rest = file_name.strip_prefix(prefix)?;
    let value = rest.strip_suffix(suffix)?;
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_wildcards() {
        assert!(has_wildcards("{movie}.tif"));
        assert!(!has_wildcards("gain.mrc"));
    }

    #[test]
    fn test_extract_wildcard_names() {
        assert_eq!(extract_wildcard_names("{id}_{frame}.tif"), vec!["id", "frame"]);
        assert!(extract_wildcard_names("{}.tif").is_empty());
    }

    #[test]
    fn test_substitute_wildcard() {
        assert_eq!(
            substitute_wildcard("ctffind4 {name}.mrc > ctf/{name}.txt", "name", "m1"),
            "ctffind4 m1.mrc > ctf/m1.txt"
        );
    }

    #[test]
    fn test_match_pattern() {
        assert_eq!(match_pattern("mic_{n}.mrc", "mic_12.mrc"), Some("12".to_string()));
        assert_eq!(match_pattern("mic_{n}.mrc", "mic_.mrc"), None);
        assert_eq!(match_pattern("{n}", "anything"), Some("anything".to_string()));
        assert_eq!(match_pattern("{a}_{b}.mrc", "x_y.mrc"), None);
        assert_eq!(match_pattern("plain.mrc", "plain.mrc"), None);
    }
}

//! Concept prompt parsing.

/// Split a comma-separated concept prompt into trimmed concepts.
///
/// Empty entries are dropped, so `""` and `" , "` yield no concepts.
///
/// ```
/// use candle_sega::parse_concept_prompt;
///
/// assert_eq!(parse_concept_prompt("apples"), ["apples"]);
/// assert_eq!(parse_concept_prompt("apple, banana, carrot"), ["apple", "banana", "carrot"]);
/// ```
pub fn parse_concept_prompt(prompt: &str) -> Vec<String> {
    prompt
        .split(',')
        .map(str::trim)
        .filter(|concept| !concept.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_concept_prompt() {
        assert_eq!(parse_concept_prompt("apples"), ["apples"]);
        assert_eq!(
            parse_concept_prompt("apple,banana ,  carrot"),
            ["apple", "banana", "carrot"]
        );
        assert_eq!(parse_concept_prompt("red hat, , smile,"), ["red hat", "smile"]);
        assert!(parse_concept_prompt("").is_empty());
        assert!(parse_concept_prompt("  ,  ").is_empty());
    }
}

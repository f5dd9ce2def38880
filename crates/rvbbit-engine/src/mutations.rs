//! Prompt mutations for candidate fan-out.
//!
//! Candidate 0 always runs the unmodified prompt; later candidates cycle
//! through the cell's declared mutation kinds.

/// Apply the mutation for candidate `index`. Index 0 is the identity;
/// index i > 0 uses `mutations[(i - 1) % len]`.
pub fn mutate_instructions(instructions: &str, mutations: &[String], index: usize) -> String {
    if index == 0 || mutations.is_empty() {
        return instructions.to_string();
    }
    let kind = &mutations[(index - 1) % mutations.len()];
    let directive = directive_for(kind, index);
    format!("{instructions}\n\n{directive}")
}

fn directive_for(kind: &str, index: usize) -> String {
    match kind {
        "rephrase" => "Approach this with different wording and structure than the obvious phrasing.".to_string(),
        "contrarian" => "Take a contrarian angle: challenge the most obvious interpretation before answering.".to_string(),
        "concise" => "Be as concise as possible; every word must earn its place.".to_string(),
        "detailed" => "Be thorough: include supporting detail and edge cases.".to_string(),
        "persona" => format!("Answer in the voice of expert persona #{index}, with their distinct style."),
        "stepwise" => "Reason step by step before giving the final answer.".to_string(),
        other => format!("Take a different approach than before (variant {other}-{index})."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_zero_is_identity() {
        let m = vec!["concise".to_string()];
        assert_eq!(mutate_instructions("write a joke", &m, 0), "write a joke");
    }

    #[test]
    fn mutations_cycle_round_robin() {
        let m = vec!["concise".to_string(), "detailed".to_string()];
        let a = mutate_instructions("p", &m, 1);
        let b = mutate_instructions("p", &m, 2);
        let c = mutate_instructions("p", &m, 3);
        assert!(a.contains("concise") || a.contains("every word"));
        assert!(b.contains("thorough"));
        // Index 3 wraps back to the first mutation.
        assert_eq!(a, c);
    }

    #[test]
    fn empty_mutation_list_is_identity() {
        assert_eq!(mutate_instructions("p", &[], 5), "p");
    }

    #[test]
    fn unknown_kinds_still_perturb() {
        let m = vec!["weird".to_string()];
        let out = mutate_instructions("p", &m, 1);
        assert_ne!(out, "p");
        assert!(out.contains("weird"));
    }
}

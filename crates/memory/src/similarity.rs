//! Similarity measures and rule-based contradiction detection.

use std::collections::BTreeSet;

/// Cosine similarity. Mismatched lengths or zero vectors score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Lowercase, drop apostrophes, and collapse everything that is not
/// alphanumeric into single spaces.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch == '\'' || ch == '\u{2019}' {
            continue;
        }
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch);
        } else {
            pending_space = true;
        }
    }
    out
}

pub fn tokens(text: &str) -> BTreeSet<String> {
    normalize(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Token-set Jaccard index over normalized words.
pub fn jaccard(a: &str, b: &str) -> f32 {
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f32 / union as f32
}

/// Similarity between a candidate and an existing memory.
///
/// Identical normalized text always scores 1.0. Otherwise cosine over the
/// embeddings when both are known, token Jaccard when either is missing.
pub fn similarity(
    candidate: &str,
    existing: &str,
    candidate_vec: Option<&[f32]>,
    existing_vec: Option<&[f32]>,
) -> f32 {
    if normalize(candidate) == normalize(existing) {
        return 1.0;
    }
    match (candidate_vec, existing_vec) {
        (Some(a), Some(b)) => cosine(a, b),
        _ => jaccard(candidate, existing),
    }
}

const NEGATIONS: &[&str] = &[
    "no", "not", "never", "none", "without", "denies", "denied", "negative", "isnt", "doesnt",
    "dont", "didnt", "wasnt", "cannot", "cant", "stopped", "discontinued", "nka", "nkda",
];

fn is_negated(text: &str) -> bool {
    tokens(text).iter().any(|t| NEGATIONS.contains(&t.as_str()))
}

/// Numeric quantities mentioned in the text, sorted and deduplicated.
fn quantities(text: &str) -> Vec<f64> {
    let mut values = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = text.chars().collect();
    for (i, &ch) in chars.iter().enumerate() {
        let decimal_point = ch == '.'
            && !current.is_empty()
            && chars.get(i + 1).is_some_and(char::is_ascii_digit);
        if ch.is_ascii_digit() || decimal_point {
            current.push(ch);
        } else if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                values.push(v);
            }
            current.clear();
        }
    }
    if let Ok(v) = current.parse::<f64>() {
        values.push(v);
    }
    values.sort_by(f64::total_cmp);
    values.dedup();
    values
}

/// Whether two statements about the same subject disagree.
///
/// Flags a negation mismatch ("not allergic" against "allergic") and
/// differing quantities when both sides state one ("10mg" against "20mg").
pub fn contradicts(a: &str, b: &str) -> bool {
    if is_negated(a) != is_negated(b) {
        return true;
    }
    let qa = quantities(a);
    let qb = quantities(b);
    !qa.is_empty() && !qb.is_empty() && qa != qb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  Patient is ALLERGIC to penicillin!! "), "patient is allergic to penicillin");
        assert_eq!(normalize("Doesn't take aspirin"), "doesnt take aspirin");
        assert_eq!(normalize("10mg, twice-daily"), "10mg twice daily");
    }

    #[test]
    fn test_jaccard() {
        assert_eq!(jaccard("likes tea", "Likes tea."), 1.0);
        assert!((jaccard("likes green tea", "likes black tea") - 0.5).abs() < 1e-6);
        assert_eq!(jaccard("", "tea"), 0.0);
    }

    #[test]
    fn test_exact_restatement_scores_one() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        let score = similarity(
            "Patient is allergic to penicillin",
            "patient is allergic to penicillin.",
            Some(&a),
            Some(&b),
        );
        assert_eq!(score, 1.0);
    }

    #[test]
    fn test_similarity_falls_back_to_lexical() {
        let v = [1.0, 0.0];
        let score = similarity("likes green tea", "likes black tea", Some(&v), None);
        assert!((score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_negation_contradiction() {
        assert!(contradicts("Allergic to penicillin", "Not allergic to penicillin"));
        assert!(contradicts("No allergy to penicillin", "Allergic to penicillin"));
        assert!(!contradicts("Allergic to penicillin", "Severely allergic to penicillin"));
    }

    #[test]
    fn test_dosage_contradiction() {
        assert!(contradicts("Takes 10mg lisinopril daily", "Takes 20mg lisinopril daily"));
        assert!(!contradicts("Takes 10mg lisinopril daily", "Takes 10 mg lisinopril each day"));
        assert!(contradicts("Takes 2.5mg warfarin", "Takes 5mg warfarin"));
        // only one side states a quantity
        assert!(!contradicts("Takes lisinopril", "Takes 10mg lisinopril"));
    }

    #[test]
    fn test_quantities() {
        assert_eq!(quantities("2.5 mg at 8. then 10"), vec![2.5, 8.0, 10.0]);
        assert!(quantities("no numbers").is_empty());
    }
}

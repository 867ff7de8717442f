//! Identity prose formatter (§4.11).
//!
//! A deterministic renderer: name, personality type, communication style,
//! and a nested self-reflection map become up to ~100 tokens of natural
//! language. Any section missing its required keys is silently omitted
//! rather than raising — the prose degrades gracefully as the self-model
//! fills in over time.

use crate::entities::IdentitySelfModel;

/// Indefinite article by initial phoneme, not just initial letter: a
/// leading vowel letter that sounds like a consonant ("a unicorn", "a
/// user") gets "a"; a leading consonant letter that's phonetically silent
/// ("an honest", "an hour") gets "an".
pub fn article_for(word: &str) -> &'static str {
    const CONSONANT_SOUNDING_VOWEL_STARTS: &[&str] = &["uni", "use", "user", "usual", "european", "one", "ouija"];
    const VOWEL_SOUNDING_CONSONANT_STARTS: &[&str] = &["honest", "honor", "hour", "heir", "herb"];

    let lower = word.to_lowercase();
    if VOWEL_SOUNDING_CONSONANT_STARTS.iter().any(|p| lower.starts_with(p)) {
        return "an";
    }
    if CONSONANT_SOUNDING_VOWEL_STARTS.iter().any(|p| lower.starts_with(p)) {
        return "a";
    }
    match lower.chars().next() {
        Some(c) if "aeiou".contains(c) => "an",
        _ => "a",
    }
}

/// Oxford-comma joining: `[]` → `""`, `[a]` → `"a"`, `[a, b]` → `"a and b"`,
/// `[a, b, c]` → `"a, b, and c"`.
pub fn join_oxford(items: &[String]) -> String {
    match items.len() {
        0 => String::new(),
        1 => items[0].clone(),
        2 => format!("{} and {}", items[0], items[1]),
        _ => {
            let (last, rest) = items.split_last().unwrap();
            format!("{}, and {}", rest.join(", "), last)
        }
    }
}

/// Quadrant label over the 2D epistemology coordinates, with
/// centrist/balanced fallback bands when a magnitude is below its axis
/// threshold (0.2 for `skeptical_idealist`, 0.3 for
/// `empiricist_rationalist`).
pub fn epistemology_label(skeptical_idealist: f64, empiricist_rationalist: f64) -> String {
    let first = if skeptical_idealist > 0.2 {
        "idealist"
    } else if skeptical_idealist < -0.2 {
        "skeptical"
    } else {
        "centrist"
    };
    let second = if empiricist_rationalist > 0.3 {
        "rationalist"
    } else if empiricist_rationalist < -0.3 {
        "empiricist"
    } else {
        "balanced"
    };

    if first == "centrist" && second == "balanced" {
        "a balanced, centrist thinker".to_string()
    } else {
        format!("a {first} {second}")
    }
}

/// Groups a `{person: [role, role, ...]}` map into one sentence per
/// person, e.g. `"Phil is your owner and creator."`.
pub fn group_relational(relational: &serde_json::Value) -> Vec<String> {
    let Some(map) = relational.as_object() else {
        return Vec::new();
    };
    let mut sentences = Vec::with_capacity(map.len());
    for (person, roles) in map {
        let Some(roles) = roles.as_array() else { continue };
        let roles: Vec<String> = roles.iter().filter_map(|r| r.as_str().map(str::to_string)).collect();
        if roles.is_empty() {
            continue;
        }
        sentences.push(format!("{person} is your {}.", join_oxford(&roles)));
    }
    sentences.sort();
    sentences
}

/// Renders an identity self-model into prose, omitting any section whose
/// required keys are absent.
pub fn render(identity: &IdentitySelfModel) -> String {
    let mut sections = Vec::new();

    let mut opening = format!("You are {}", identity.name);
    if let Some(personality) = &identity.personality_type {
        opening.push_str(&format!(", {} {personality}", article_for(personality)));
    }
    opening.push('.');
    sections.push(opening);

    if let Some(style) = &identity.communication_style {
        sections.push(format!("You communicate in a {style} manner."));
    }

    let reflection = &identity.self_reflection;

    if let Some(being) = reflection.get("being").and_then(|v| v.get("description")).and_then(|v| v.as_str()) {
        sections.push(being.to_string());
    }

    if let Some(purpose) = reflection.get("purpose").and_then(|v| v.as_str()) {
        sections.push(format!("Your purpose is {purpose}."));
    }

    if let Some(principles) = reflection.get("principles").and_then(|v| v.as_array()) {
        let principles: Vec<String> = principles.iter().filter_map(|p| p.as_str().map(str::to_string)).collect();
        if !principles.is_empty() {
            sections.push(format!("You hold these principles: {}.", join_oxford(&principles)));
        }
    }

    if let Some(philosophy) = reflection.get("philosophy") {
        let skeptical_idealist = philosophy.get("skeptical_idealist").and_then(|v| v.as_f64());
        let empiricist_rationalist = philosophy.get("empiricist_rationalist").and_then(|v| v.as_f64());
        if let (Some(si), Some(er)) = (skeptical_idealist, empiricist_rationalist) {
            sections.push(format!("Philosophically, you are {}.", epistemology_label(si, er)));
        }
    }

    if let Some(relational) = reflection.get("relational") {
        let sentences = group_relational(relational);
        sections.extend(sentences);
    }

    if let Some(arc) = reflection.get("arc").and_then(|v| v.as_str()) {
        sections.push(arc.to_string());
    }

    sections.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::AnimaId;

    #[test]
    fn article_for_handles_true_vowel() {
        assert_eq!(article_for("empathetic"), "an");
    }

    #[test]
    fn article_for_handles_consonant_sounding_vowel_start() {
        assert_eq!(article_for("unicorn-like"), "a");
    }

    #[test]
    fn article_for_handles_silent_h() {
        assert_eq!(article_for("honest"), "an");
    }

    #[test]
    fn article_for_default_consonant() {
        assert_eq!(article_for("reflective"), "a");
    }

    #[test]
    fn join_oxford_handles_all_lengths() {
        assert_eq!(join_oxford(&[]), "");
        assert_eq!(join_oxford(&["a".to_string()]), "a");
        assert_eq!(join_oxford(&["a".to_string(), "b".to_string()]), "a and b");
        assert_eq!(
            join_oxford(&["a".to_string(), "b".to_string(), "c".to_string()]),
            "a, b, and c"
        );
    }

    #[test]
    fn epistemology_label_quadrants() {
        assert_eq!(epistemology_label(0.5, 0.5), "a idealist rationalist");
        assert_eq!(epistemology_label(-0.5, -0.5), "a skeptical empiricist");
        assert_eq!(epistemology_label(0.05, 0.1), "a balanced, centrist thinker");
    }

    #[test]
    fn group_relational_combines_roles_per_person() {
        let value = serde_json::json!({ "Phil": ["owner", "creator"] });
        let sentences = group_relational(&value);
        assert_eq!(sentences, vec!["Phil is your owner and creator.".to_string()]);
    }

    #[test]
    fn render_omits_missing_sections() {
        let identity = IdentitySelfModel::new(AnimaId::new(), "Aria");
        let prose = render(&identity);
        assert_eq!(prose, "You are Aria.");
    }

    #[test]
    fn render_includes_present_sections() {
        let mut identity = IdentitySelfModel::new(AnimaId::new(), "Aria");
        identity.personality_type = Some("empathetic companion".to_string());
        identity.self_reflection = serde_json::json!({
            "purpose": "to help you think clearly",
            "relational": { "Phil": ["owner", "creator"] },
        });
        let prose = render(&identity);
        assert!(prose.contains("an empathetic companion"));
        assert!(prose.contains("Your purpose is to help you think clearly."));
        assert!(prose.contains("Phil is your owner and creator."));
    }
}

//! Random id generation.

/// Alphabet without vowels or easily confused glyphs (I/1, O/0), so ids
/// stay readable and never spell anything.
const ID_ALPHABET: [char; 31] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'B', 'C', 'D', 'F', 'G', 'H', 'J', 'K', 'L',
    'M', 'N', 'P', 'Q', 'R', 'S', 'T', 'V', 'W', 'X', 'Y', 'Z',
];

/// Generates a random id of the given length.
///
/// Used for workflow execution names and tracking-event suffixes, both of
/// which end up in service identifiers that only permit a narrow character
/// set.
pub fn generate_id(len: usize) -> String {
    nanoid::format(nanoid::rngs::default, &ID_ALPHABET, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_requested_length() {
        assert_eq!(generate_id(6).len(), 6);
        assert_eq!(generate_id(12).len(), 12);
    }

    #[test]
    fn only_uses_alphabet_characters() {
        let id = generate_id(200);
        assert!(id.chars().all(|c| ID_ALPHABET.contains(&c)));
    }

    #[test]
    fn two_ids_differ() {
        assert_ne!(generate_id(12), generate_id(12));
    }
}

//! Human-friendly generated names for rooms and members.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::protocol::RoomId;

const ROOM_ADJECTIVES: [&str; 10] = [
    "happy", "bright", "cool", "swift", "brave", "calm", "clever", "gentle", "kind", "wise",
];
const ROOM_COLORS: [&str; 10] = [
    "red", "blue", "green", "yellow", "purple", "orange", "pink", "cyan", "magenta", "lime",
];
const ROOM_ANIMALS: [&str; 10] = [
    "cat", "dog", "bird", "fish", "bear", "lion", "tiger", "wolf", "fox", "deer",
];

const NAME_ADJECTIVES: [&str; 10] = [
    "Anonymous", "Bright", "Swift", "Clever", "Gentle", "Bold", "Quick", "Silent", "Wise", "Brave",
];
const NAME_ANIMALS: [&str; 10] = [
    "Hawk", "Wolf", "Tiger", "Eagle", "Bear", "Lion", "Fox", "Deer", "Owl", "Cat",
];

fn pick<'a>(rng: &mut impl Rng, words: &[&'a str]) -> &'a str {
    words.choose(rng).copied().unwrap_or_default()
}

/// Generate an `adjective-color-animal` room id.
pub fn generate_room_id() -> RoomId {
    let mut rng = rand::thread_rng();
    let raw = format!(
        "{}-{}-{}",
        pick(&mut rng, &ROOM_ADJECTIVES),
        pick(&mut rng, &ROOM_COLORS),
        pick(&mut rng, &ROOM_ANIMALS)
    );
    // The word lists only contain valid characters.
    RoomId::parse(&raw).unwrap_or_else(|_| unreachable!("generated room id {raw} is invalid"))
}

/// Generate an `AdjectiveAnimalNNN` display name.
pub fn generate_pseudonym() -> String {
    let mut rng = rand::thread_rng();
    let number: u32 = rng.gen_range(0..1000);
    format!(
        "{}{}{}",
        pick(&mut rng, &NAME_ADJECTIVES),
        pick(&mut rng, &NAME_ANIMALS),
        number
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_room_id_shape() {
        for _ in 0..50 {
            let id = generate_room_id();
            let parts: Vec<&str> = id.as_str().split('-').collect();
            assert_eq!(parts.len(), 3);
            assert!(ROOM_ADJECTIVES.contains(&parts[0]));
            assert!(ROOM_COLORS.contains(&parts[1]));
            assert!(ROOM_ANIMALS.contains(&parts[2]));
        }
    }

    #[test]
    fn test_generated_pseudonym_shape() {
        for _ in 0..50 {
            let name = generate_pseudonym();
            let adjective = NAME_ADJECTIVES.iter().find(|a| name.starts_with(*a));
            assert!(adjective.is_some(), "unexpected pseudonym {name}");
            let digits: String = name.chars().filter(|c| c.is_ascii_digit()).collect();
            assert!(!digits.is_empty());
            assert!(digits.parse::<u32>().unwrap() < 1000);
        }
    }
}

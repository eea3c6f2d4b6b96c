//! Token ids → dream text.
//!
//! A fixed 60-word placeholder vocabulary. Rendering stops at the first
//! [`PAD`] or [`END`]; ids beyond the list wrap around (`id mod 60`).

pub const PAD: usize = 0;
pub const START: usize = 1;
pub const END: usize = 2;

/// Text returned when no word survives rendering.
pub const FALLBACK_TEXT: &str = "silent dream";

pub const DREAM_WORDS: [&str; 60] = [
    "pad", "start", "end", "dream", "sleep", "rest", "wake", "night", "day", "mind",
    "brain", "think", "feel", "see", "hear", "touch", "move", "walk", "run", "fly",
    "float", "fall", "rise", "light", "dark", "bright", "dim", "color", "blue", "red",
    "green", "white", "black", "water", "fire", "air", "earth", "sky", "ground", "up",
    "down", "fast", "slow", "big", "small", "hot", "cold", "soft", "hard", "smooth",
    "rough", "vision", "magic", "realm", "spirit", "essence", "mystery", "wonder", "energy",
    "power",
];

/// Render a token sequence as space-separated words.
pub fn tokens_to_text(tokens: &[usize]) -> String {
    let words: Vec<&str> = tokens
        .iter()
        .take_while(|&&t| t != PAD && t != END)
        .map(|&t| word(t))
        .collect();
    if words.is_empty() {
        FALLBACK_TEXT.to_string()
    } else {
        words.join(" ")
    }
}

/// Word for a single id, wrapping ids past the end of the list.
pub fn word(token: usize) -> &'static str {
    DREAM_WORDS[token % DREAM_WORDS.len()]
}

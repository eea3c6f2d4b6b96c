//! Heuristic EEG channel selection by label.
//!
//! A channel is kept when its upper-cased label contains any of
//! [`EEG_MARKERS`]. This is a best-effort label filter, not a montage lookup:
//! `"EOG horizontal"` contains `O` and is therefore kept, `"Resp oro-nasal"`
//! too. The selection is capped at `max` (the pipeline default is
//! [`MAX_SELECTED`]); when nothing matches the first `max` raw channels are
//! used instead.

/// Substrings that mark a label as EEG (matched against the upper-cased label).
pub const EEG_MARKERS: [&str; 5] = ["EEG", "F", "C", "P", "O"];

/// Default upper bound on selected channels.
pub const MAX_SELECTED: usize = 19;

/// `true` if the label carries one of the EEG markers (case-insensitive).
pub fn is_eeg_label(name: &str) -> bool {
    let upper = name.to_uppercase();
    EEG_MARKERS.iter().any(|m| upper.contains(m))
}

/// Choose the channels to keep, preserving recording order.
pub fn select_channels(names: &[String], max: usize) -> Vec<String> {
    let matched: Vec<String> = names
        .iter()
        .filter(|n| is_eeg_label(n))
        .take(max)
        .cloned()
        .collect();
    if matched.is_empty() {
        names.iter().take(max).cloned().collect()
    } else {
        matched
    }
}

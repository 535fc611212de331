mod classifier;

use crate::config::ScoringConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use classifier::{ClassifyError, FrameClassifier, RemoteFrameClassifier};

/// Labels the frame classifier can produce.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EmotionLabel {
    Surprise,
    Neutral,
    Anger,
    Happy,
    Sad,
}

impl EmotionLabel {
    pub const ALL: [EmotionLabel; 5] = [
        EmotionLabel::Surprise,
        EmotionLabel::Neutral,
        EmotionLabel::Anger,
        EmotionLabel::Happy,
        EmotionLabel::Sad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionLabel::Surprise => "Surprise",
            EmotionLabel::Neutral => "Neutral",
            EmotionLabel::Anger => "Anger",
            EmotionLabel::Happy => "Happy",
            EmotionLabel::Sad => "Sad",
        }
    }

    /// Anger and Sad pull the emotion score down.
    pub fn is_negative(&self) -> bool {
        matches!(self, EmotionLabel::Anger | EmotionLabel::Sad)
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown emotion label: {0}")]
pub struct UnknownLabel(pub String);

impl FromStr for EmotionLabel {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownLabel(wanted.to_owned()))
    }
}

/// Per-label frame counts, remembering the order labels were first seen.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmotionTally {
    counts: Vec<(EmotionLabel, u32)>,
}

impl EmotionTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, label: EmotionLabel) {
        match self.counts.iter_mut().find(|(l, _)| *l == label) {
            Some((_, n)) => *n += 1,
            None => self.counts.push((label, 1)),
        }
    }

    pub fn count(&self, label: EmotionLabel) -> u32 {
        self.counts
            .iter()
            .find(|(l, _)| *l == label)
            .map_or(0, |(_, n)| *n)
    }

    pub fn total(&self) -> u32 {
        self.counts.iter().map(|(_, n)| n).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Labels by descending count. Equal counts keep first-seen order.
    pub fn ranked(&self) -> Vec<(EmotionLabel, u32)> {
        let mut ranked = self.counts.clone();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        ranked
    }

    pub fn dominant(&self, n: usize) -> Vec<EmotionLabel> {
        self.ranked().into_iter().take(n).map(|(l, _)| l).collect()
    }
}

impl FromIterator<EmotionLabel> for EmotionTally {
    fn from_iter<I: IntoIterator<Item = EmotionLabel>>(iter: I) -> Self {
        let mut tally = Self::new();
        for label in iter {
            tally.record(label);
        }
        tally
    }
}

/// Low score if Anger or Sad is among the two dominant labels, high otherwise.
/// An empty tally has no dominant labels and scores high.
pub fn emotion_score(tally: &EmotionTally, scoring: &ScoringConfig) -> i64 {
    if tally.dominant(2).iter().any(EmotionLabel::is_negative) {
        scoring.emotion_low
    } else {
        scoring.emotion_high
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EmotionLabel::*;

    fn tally(counts: &[(EmotionLabel, u32)]) -> EmotionTally {
        counts
            .iter()
            .flat_map(|&(l, n)| std::iter::repeat_n(l, n as usize))
            .collect()
    }

    #[test]
    fn happy_and_neutral_dominant_scores_high() {
        let t = tally(&[(Happy, 5), (Neutral, 3), (Sad, 1)]);
        assert_eq!(t.dominant(2), vec![Happy, Neutral]);
        assert_eq!(emotion_score(&t, &ScoringConfig::default()), 10);
    }

    #[test]
    fn sad_and_anger_dominant_scores_low() {
        let t = tally(&[(Sad, 5), (Anger, 4), (Happy, 1)]);
        assert_eq!(emotion_score(&t, &ScoringConfig::default()), 5);
    }

    #[test]
    fn single_negative_in_top_two_scores_low() {
        let t = tally(&[(Happy, 6), (Anger, 2), (Neutral, 1)]);
        assert_eq!(emotion_score(&t, &ScoringConfig::default()), 5);
    }

    #[test]
    fn ties_keep_first_seen_order() {
        let t: EmotionTally = [Neutral, Sad, Happy, Happy, Neutral, Sad].into_iter().collect();
        assert_eq!(t.dominant(2), vec![Neutral, Sad]);
        assert_eq!(emotion_score(&t, &ScoringConfig::default()), 5);

        let t: EmotionTally = [Happy, Neutral, Sad, Happy, Neutral, Sad].into_iter().collect();
        assert_eq!(emotion_score(&t, &ScoringConfig::default()), 10);
    }

    #[test]
    fn empty_tally_scores_high() {
        assert_eq!(emotion_score(&EmotionTally::new(), &ScoringConfig::default()), 10);
    }

    #[test]
    fn custom_score_values_are_used() {
        let scoring = ScoringConfig {
            emotion_low: 1,
            emotion_high: 3,
            ..ScoringConfig::default()
        };
        assert_eq!(emotion_score(&tally(&[(Sad, 1)]), &scoring), 1);
        assert_eq!(emotion_score(&tally(&[(Happy, 1)]), &scoring), 3);
    }

    #[test]
    fn tally_counts() {
        let t = tally(&[(Surprise, 2), (Happy, 3)]);
        assert_eq!(t.count(Surprise), 2);
        assert_eq!(t.count(Sad), 0);
        assert_eq!(t.total(), 5);
    }

    #[test]
    fn labels_parse_case_insensitively() {
        assert_eq!("happy".parse::<EmotionLabel>().unwrap(), Happy);
        assert_eq!(" ANGER ".parse::<EmotionLabel>().unwrap(), Anger);
        assert!("Fearful".parse::<EmotionLabel>().is_err());
    }
}

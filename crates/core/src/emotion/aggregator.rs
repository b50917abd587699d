use crate::config::StableSamples;
use crate::emotion::{dominant_mood, Detection, Expression, Mood};
use crate::util::RingBuffer;

/// Outcome of feeding one sample to the [`MoodAggregator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoodUpdate {
    pub sequence: u64,
    /// Dominant mood of this sample alone.
    pub sampled: Mood,
    /// Current mood after this sample.
    pub current: Mood,
    /// Whether `current` differs from the previous current mood.
    pub changed: bool,
    /// Set when this change should trigger a recommendation fetch.
    pub fetch: Option<Expression>,
}

/// Turns per-frame classifier output into a stable current mood.
///
/// A candidate mood becomes current once the last `stable_samples` samples
/// agree on it. Samples that arrive with a sequence number at or below the
/// last applied one are stale and ignored.
#[derive(Clone, Debug)]
pub struct MoodAggregator {
    window: RingBuffer<Mood>,
    current: Mood,
    last_sequence: Option<u64>,
}

impl MoodAggregator {
    pub fn new(stable_samples: StableSamples) -> Self {
        Self {
            window: RingBuffer::new(stable_samples.get()),
            current: Mood::NoFace,
            last_sequence: None,
        }
    }

    pub fn current(&self) -> Mood {
        self.current
    }

    pub fn observe(&mut self, sequence: u64, detections: &[Detection]) -> Option<MoodUpdate> {
        self.observe_mood(sequence, dominant_mood(detections))
    }

    /// Returns `None` when the sample is stale.
    pub fn observe_mood(&mut self, sequence: u64, sampled: Mood) -> Option<MoodUpdate> {
        if self.last_sequence.is_some_and(|last| sequence <= last) {
            tracing::debug!(sequence, "dropping stale sample");
            return None;
        }
        self.last_sequence = Some(sequence);
        self.window.push(sampled);

        let previous = self.current;
        if let Some(&agreed) = self.window.unanimous() {
            self.current = agreed;
        }
        let changed = previous != self.current;

        // Every change onto a face fetches, including `none -> happy` after
        // an earlier `happy`.
        let fetch = self.current.expression().filter(|_| changed);

        Some(MoodUpdate {
            sequence,
            sampled,
            current: self.current,
            changed,
            fetch,
        })
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.current = Mood::NoFace;
        self.last_sequence = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(pairs: &[(Expression, f32)]) -> Vec<Detection> {
        vec![Detection::new(pairs.iter().copied())]
    }

    fn aggregator(n: usize) -> MoodAggregator {
        MoodAggregator::new(StableSamples::new(n).expect("nonzero"))
    }

    #[test]
    fn happy_happy_none_fetches_once() {
        let mut agg = aggregator(1);
        let samples = [
            det(&[(Expression::Happy, 0.9), (Expression::Sad, 0.1)]),
            det(&[(Expression::Happy, 0.8), (Expression::Sad, 0.2)]),
            Vec::new(),
        ];

        let updates: Vec<MoodUpdate> = samples
            .iter()
            .zip(1u64..)
            .filter_map(|(s, seq)| agg.observe(seq, s))
            .collect();

        let moods: Vec<Mood> = updates.iter().map(|u| u.current).collect();
        assert_eq!(
            moods,
            vec![
                Mood::Detected(Expression::Happy),
                Mood::Detected(Expression::Happy),
                Mood::NoFace
            ]
        );
        let fetches: Vec<Expression> = updates.iter().filter_map(|u| u.fetch).collect();
        assert_eq!(fetches, vec![Expression::Happy]);
    }

    #[test]
    fn one_change_event_per_run_of_identical_labels() {
        let mut agg = aggregator(1);
        let labels = [
            Some(Expression::Happy),
            Some(Expression::Happy),
            Some(Expression::Sad),
            Some(Expression::Sad),
            Some(Expression::Sad),
            None,
            None,
            Some(Expression::Happy),
        ];
        let changes = labels
            .iter()
            .zip(1u64..)
            .filter_map(|(l, seq)| {
                let mood = l.map_or(Mood::NoFace, Mood::Detected);
                agg.observe_mood(seq, mood)
            })
            .filter(|u| u.changed)
            .count();
        // happy, sad, none, happy
        assert_eq!(changes, 4);
    }

    #[test]
    fn face_returning_with_same_mood_fetches_again() {
        let mut agg = aggregator(1);
        let happy = Mood::Detected(Expression::Happy);
        assert_eq!(agg.observe_mood(1, happy).and_then(|u| u.fetch), Some(Expression::Happy));
        let gone = agg.observe_mood(2, Mood::NoFace).expect("fresh");
        assert!(gone.changed);
        assert_eq!(gone.fetch, None);

        let back = agg.observe_mood(3, happy).expect("fresh");
        assert!(back.changed);
        assert_eq!(back.fetch, Some(Expression::Happy));

        let steady = agg.observe_mood(4, happy).expect("fresh");
        assert_eq!(steady.fetch, None);
        let sad = agg.observe_mood(5, Mood::Detected(Expression::Sad)).expect("fresh");
        assert_eq!(sad.fetch, Some(Expression::Sad));
    }

    #[test]
    fn stale_samples_are_ignored() {
        let mut agg = aggregator(1);
        agg.observe_mood(5, Mood::Detected(Expression::Sad));
        assert_eq!(agg.observe_mood(4, Mood::Detected(Expression::Happy)), None);
        assert_eq!(agg.observe_mood(5, Mood::Detected(Expression::Happy)), None);
        assert_eq!(agg.current(), Mood::Detected(Expression::Sad));
    }

    #[test]
    fn debounce_window_suppresses_oscillation() {
        let mut agg = aggregator(3);
        let happy = Mood::Detected(Expression::Happy);
        let sad = Mood::Detected(Expression::Sad);

        let mut fetches = Vec::new();
        for (seq, mood) in (1u64..).zip([happy, sad, happy, sad, happy, happy, happy]) {
            if let Some(e) = agg.observe_mood(seq, mood).and_then(|u| u.fetch) {
                fetches.push((seq, e));
            }
        }
        assert_eq!(fetches, vec![(7, Expression::Happy)]);
        assert_eq!(agg.current(), happy);
    }

    #[test]
    fn reset_forgets_mood_and_sequence() {
        let mut agg = aggregator(1);
        agg.observe_mood(10, Mood::Detected(Expression::Angry));
        agg.reset();
        assert_eq!(agg.current(), Mood::NoFace);

        let again = agg
            .observe_mood(1, Mood::Detected(Expression::Angry))
            .expect("sequence restarts after reset");
        assert_eq!(again.fetch, Some(Expression::Angry));
    }
}

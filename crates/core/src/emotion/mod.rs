mod aggregator;

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub use aggregator::{MoodAggregator, MoodUpdate};

/// The fixed label set produced by the expression classifier, in the order
/// the classifier reports them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expression {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
}

impl Expression {
    pub const ALL: [Expression; 7] = [
        Expression::Neutral,
        Expression::Happy,
        Expression::Sad,
        Expression::Angry,
        Expression::Fearful,
        Expression::Disgusted,
        Expression::Surprised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Expression::Neutral => "neutral",
            Expression::Happy => "happy",
            Expression::Sad => "sad",
            Expression::Angry => "angry",
            Expression::Fearful => "fearful",
            Expression::Disgusted => "disgusted",
            Expression::Surprised => "surprised",
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown expression label {0:?}")]
pub struct UnknownExpression(pub String);

impl FromStr for Expression {
    type Err = UnknownExpression;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Expression::ALL
            .into_iter()
            .find(|e| e.as_str() == wanted)
            .ok_or_else(|| UnknownExpression(s.to_owned()))
    }
}

/// The user's current mood: a dominant expression, or no face in view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Mood {
    #[default]
    NoFace,
    Detected(Expression),
}

impl Mood {
    pub fn expression(&self) -> Option<Expression> {
        match self {
            Mood::NoFace => None,
            Mood::Detected(e) => Some(*e),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::NoFace => "none",
            Mood::Detected(e) => e.as_str(),
        }
    }
}

impl From<Expression> for Mood {
    fn from(e: Expression) -> Self {
        Mood::Detected(e)
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One face found in a frame, with a confidence per expression label.
///
/// Entries keep the order the classifier reported them in; that order breaks
/// ties in [`Detection::dominant`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Detection {
    expressions: Vec<(Expression, f32)>,
}

impl Detection {
    pub fn new(expressions: impl IntoIterator<Item = (Expression, f32)>) -> Self {
        let expressions = expressions
            .into_iter()
            .map(|(e, p)| (e, if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 }))
            .collect();
        Self { expressions }
    }

    pub fn expressions(&self) -> &[(Expression, f32)] {
        &self.expressions
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }

    pub fn confidence(&self, expression: Expression) -> Option<f32> {
        self.expressions
            .iter()
            .find(|(e, _)| *e == expression)
            .map(|(_, p)| *p)
    }

    /// Highest-confidence label; the first one reported wins a tie.
    pub fn dominant(&self) -> Option<(Expression, f32)> {
        let mut best: Option<(Expression, f32)> = None;
        for &(e, p) in &self.expressions {
            match best {
                Some((_, best_p)) if p <= best_p => {}
                _ => best = Some((e, p)),
            }
        }
        best
    }
}

impl FromIterator<(Expression, f32)> for Detection {
    fn from_iter<I: IntoIterator<Item = (Expression, f32)>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Mood of one frame: the dominant label of the first detection, if any.
pub fn dominant_mood(detections: &[Detection]) -> Mood {
    detections
        .first()
        .and_then(Detection::dominant)
        .map_or(Mood::NoFace, |(e, _)| Mood::Detected(e))
}

//! Age and gender classification from a preprocessed face tensor.

use crate::model::{ModelError, ModelHandle};
use crate::types::{ScoreVector, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed label set indexed by network output position.
pub trait ClassLabel: Copy + fmt::Debug + fmt::Display + Send + Sync + 'static {
    const COUNT: usize;

    fn from_index(index: usize) -> Option<Self>;

    fn as_str(&self) -> &'static str;
}

/// Age bracket, in network class-index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgeBracket {
    #[serde(rename = "0-2")]
    Infant,
    #[serde(rename = "4-6")]
    EarlyChild,
    #[serde(rename = "8-13")]
    Child,
    #[serde(rename = "15-20")]
    Teen,
    #[serde(rename = "25-32")]
    YoungAdult,
    #[serde(rename = "38-43")]
    Adult,
    #[serde(rename = "48-53")]
    MiddleAged,
    #[serde(rename = "60+")]
    Senior,
}

impl AgeBracket {
    pub const ALL: [AgeBracket; 8] = [
        AgeBracket::Infant,
        AgeBracket::EarlyChild,
        AgeBracket::Child,
        AgeBracket::Teen,
        AgeBracket::YoungAdult,
        AgeBracket::Adult,
        AgeBracket::MiddleAged,
        AgeBracket::Senior,
    ];
}

impl ClassLabel for AgeBracket {
    const COUNT: usize = 8;

    fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    fn as_str(&self) -> &'static str {
        match self {
            AgeBracket::Infant => "0-2",
            AgeBracket::EarlyChild => "4-6",
            AgeBracket::Child => "8-13",
            AgeBracket::Teen => "15-20",
            AgeBracket::YoungAdult => "25-32",
            AgeBracket::Adult => "38-43",
            AgeBracket::MiddleAged => "48-53",
            AgeBracket::Senior => "60+",
        }
    }
}

impl fmt::Display for AgeBracket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl ClassLabel for Gender {
    const COUNT: usize = 2;

    fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Gender::Male),
            1 => Some(Gender::Female),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A label with the class index and raw score that selected it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction<L> {
    pub label: L,
    pub index: usize,
    pub score: f32,
}

/// Run one forward pass and pick the highest-scoring class.
pub fn predict<L: ClassLabel>(model: &ModelHandle, tensor: &Tensor) -> Result<Prediction<L>, ModelError> {
    if model.class_count() != L::COUNT {
        return Err(ModelError::OutputShape {
            expected: L::COUNT,
            actual: model.class_count(),
        });
    }

    let scores = ScoreVector::new(model.forward(tensor)?);
    if scores.len() != L::COUNT {
        return Err(ModelError::OutputShape {
            expected: L::COUNT,
            actual: scores.len(),
        });
    }

    let index = scores.argmax().ok_or(ModelError::InvalidScores)?;
    let label = L::from_index(index).ok_or(ModelError::OutputShape {
        expected: L::COUNT,
        actual: scores.len(),
    })?;
    let score = scores.as_slice()[index];

    tracing::debug!(model = model.name(), label = %label, index, score, "classified");

    Ok(Prediction { label, index, score })
}

/// Label-only form of [`predict`].
pub fn classify<L: ClassLabel>(model: &ModelHandle, tensor: &Tensor) -> Result<L, ModelError> {
    predict::<L>(model, tensor).map(|p| p.label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::StubNetwork;
    use crate::model::Network;
    use crate::preprocess::{INPUT_CHANNELS, INPUT_SIZE};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tensor() -> Tensor {
        Tensor::zeros(INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE)
    }

    fn handle(scores: Vec<f32>) -> ModelHandle {
        let count = scores.len();
        ModelHandle::from_network("stub", count, StubNetwork::new(scores)).unwrap()
    }

    /// Correct length on the probe pass, something else afterwards.
    struct ShiftingNetwork {
        calls: AtomicUsize,
        probe: Vec<f32>,
        later: Vec<f32>,
    }

    impl Network for ShiftingNetwork {
        fn forward(&self, _input: &Tensor) -> Result<Vec<f32>, ModelError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(self.probe.clone())
            } else {
                Ok(self.later.clone())
            }
        }
    }

    fn shifting(later: Vec<f32>) -> ModelHandle {
        let network = Arc::new(ShiftingNetwork {
            calls: AtomicUsize::new(0),
            probe: vec![0.0; 8],
            later,
        });
        ModelHandle::from_network("shifting", 8, network).unwrap()
    }

    #[test]
    fn test_age_labels_in_index_order() {
        let labels: Vec<&str> = (0..AgeBracket::COUNT)
            .map(|i| AgeBracket::from_index(i).unwrap().as_str())
            .collect();
        assert_eq!(labels, ["0-2", "4-6", "8-13", "15-20", "25-32", "38-43", "48-53", "60+"]);
        assert_eq!(AgeBracket::from_index(8), None);
    }

    #[test]
    fn test_gender_labels_in_index_order() {
        assert_eq!(Gender::from_index(0), Some(Gender::Male));
        assert_eq!(Gender::from_index(1), Some(Gender::Female));
        assert_eq!(Gender::from_index(2), None);
        assert_eq!(Gender::Female.to_string(), "female");
    }

    #[test]
    fn test_label_serializes_as_bracket_text() {
        assert_eq!(serde_json::to_string(&AgeBracket::Senior).unwrap(), "\"60+\"");
        assert_eq!(serde_json::to_string(&Gender::Male).unwrap(), "\"male\"");
    }

    #[test]
    fn test_classify_picks_maximum() {
        let model = handle(vec![0.1, 0.05, 0.6, 0.05, 0.05, 0.05, 0.05, 0.05]);
        assert_eq!(classify::<AgeBracket>(&model, &tensor()).unwrap(), AgeBracket::Child);
    }

    #[test]
    fn test_classify_tie_takes_lowest_index() {
        let model = handle(vec![0.1, 0.4, 0.1, 0.4, 0.0, 0.0, 0.0, 0.0]);
        let p = predict::<AgeBracket>(&model, &tensor()).unwrap();
        assert_eq!(p.label.as_str(), "4-6");
        assert_eq!(p.index, 1);
        assert!((p.score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_classify_last_bracket() {
        let model = handle(vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.9]);
        assert_eq!(classify::<AgeBracket>(&model, &tensor()).unwrap().as_str(), "60+");
    }

    #[test]
    fn test_classify_is_repeatable() {
        let model = handle(vec![0.3, 0.1, 0.1, 0.1, 0.1, 0.2, 0.05, 0.05]);
        let first = classify::<AgeBracket>(&model, &tensor()).unwrap();
        for _ in 0..5 {
            assert_eq!(classify::<AgeBracket>(&model, &tensor()).unwrap(), first);
        }
    }

    #[test]
    fn test_classify_wrong_label_set() {
        let model = handle(vec![0.5, 0.5]);
        assert!(matches!(
            classify::<AgeBracket>(&model, &tensor()),
            Err(ModelError::OutputShape { expected: 8, actual: 2 })
        ));
    }

    #[test]
    fn test_classify_output_length_changes() {
        let model = shifting(vec![0.2; 7]);
        assert!(matches!(
            classify::<AgeBracket>(&model, &tensor()),
            Err(ModelError::OutputShape { expected: 8, actual: 7 })
        ));
    }

    #[test]
    fn test_classify_nan_scores() {
        let mut scores = vec![0.1; 8];
        scores[3] = f32::NAN;
        let model = shifting(scores);
        assert!(matches!(
            classify::<AgeBracket>(&model, &tensor()),
            Err(ModelError::InvalidScores)
        ));
    }

    #[test]
    fn test_gender_prediction() {
        let model = handle(vec![0.2, 0.8]);
        assert_eq!(classify::<Gender>(&model, &tensor()).unwrap(), Gender::Female);
        assert_eq!(predict::<Gender>(&model, &tensor()).unwrap().index, 1);
    }

    #[test]
    fn test_shared_handle_concurrent_use() {
        let model = handle(vec![0.0, 0.0, 0.0, 0.0, 0.7, 0.1, 0.1, 0.1]);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let model = model.clone();
                std::thread::spawn(move || classify::<AgeBracket>(&model, &tensor()).unwrap())
            })
            .collect();
        for t in threads {
            assert_eq!(t.join().unwrap(), AgeBracket::YoungAdult);
        }
    }
}

//! Inference-time feature contract
//!
//! A request describes one day for one person. It is clamped to the input
//! ranges the models were trained on, routed to Mode B when both previous-day
//! labels are supplied, and encoded through the same [`FeatureSchema`] used to
//! build the training datasets. The encoded columns must match a model's
//! registered `feature_columns` exactly, in set and in order.

use log::warn;
use serde::{Deserialize, Deserializer, Serialize};

use crate::encoder::FeatureSchema;
use crate::error::PipelineError;
use crate::labels::CLASS_NAMES;
use crate::model::ModelBundle;
use crate::types::{DailyRecord, LagValues, Mode, SubjectDay, Target};

pub const SLEEP_MINUTES_RANGE: (f64, f64) = (0.0, 900.0);
pub const RESTING_HR_RANGE: (f64, f64) = (35.0, 110.0);
pub const ORDINAL_RANGE: (f64, f64) = (0.0, 5.0);
pub const LAG_RANGE: (f64, f64) = (0.0, 2.0);
pub const WEEKEND_RANGE: (f64, f64) = (0.0, 1.0);

/// Subject id given to the synthetic record built from a request
const REQUEST_SUBJECT: &str = "request";

/// One day of inputs for a prediction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default)]
    pub phase: Option<String>,
    /// 0 or 1; `true`/`false` are accepted too
    #[serde(default, deserialize_with = "weekend_flag")]
    pub is_weekend: Option<f64>,
    #[serde(default)]
    pub sleep_duration_minutes: Option<f64>,
    #[serde(default, rename = "resting_heart_rate__value")]
    pub resting_heart_rate: Option<f64>,
    #[serde(default, rename = "cramps_num")]
    pub cramps: Option<f64>,
    #[serde(default, rename = "headaches_num")]
    pub headaches: Option<f64>,
    #[serde(default, rename = "sleepissue_num")]
    pub sleep_issue: Option<f64>,
    #[serde(default, rename = "stress_num")]
    pub stress: Option<f64>,
    /// Yesterday's energy class (0-2)
    #[serde(default)]
    pub lag1_energy: Option<f64>,
    /// Yesterday's mood stability class (0-2)
    #[serde(default)]
    pub lag1_mood: Option<f64>,
}

/// Which feature set serves a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Route {
    ModeA,
    ModeB { lag1_energy: u8, lag1_mood: u8 },
}

impl Route {
    pub fn mode(&self) -> Mode {
        match self {
            Route::ModeA => Mode::A,
            Route::ModeB { .. } => Mode::B,
        }
    }

    fn lags(&self) -> LagValues {
        match *self {
            Route::ModeA => LagValues::default(),
            Route::ModeB {
                lag1_energy,
                lag1_mood,
            } => LagValues {
                lag1_energy: Some(lag1_energy),
                lag1_mood: Some(lag1_mood),
            },
        }
    }
}

impl InferenceRequest {
    /// Copy of this request with every input forced into its valid range
    pub fn clamped(&self) -> Self {
        Self {
            phase: self.phase.clone(),
            is_weekend: clamp("is_weekend", self.is_weekend, WEEKEND_RANGE).map(f64::round),
            sleep_duration_minutes: clamp("sleep_duration_minutes", self.sleep_duration_minutes, SLEEP_MINUTES_RANGE),
            resting_heart_rate: clamp("resting_heart_rate__value", self.resting_heart_rate, RESTING_HR_RANGE),
            cramps: clamp("cramps_num", self.cramps, ORDINAL_RANGE),
            headaches: clamp("headaches_num", self.headaches, ORDINAL_RANGE),
            sleep_issue: clamp("sleepissue_num", self.sleep_issue, ORDINAL_RANGE),
            stress: clamp("stress_num", self.stress, ORDINAL_RANGE),
            lag1_energy: clamp("lag1_energy", self.lag1_energy, LAG_RANGE).map(f64::round),
            lag1_mood: clamp("lag1_mood", self.lag1_mood, LAG_RANGE).map(f64::round),
        }
    }

    /// Mode B only when both previous-day classes are known
    pub fn route(&self) -> Route {
        let request = self.clamped();
        match (request.lag1_energy, request.lag1_mood) {
            (Some(energy), Some(mood)) => Route::ModeB {
                lag1_energy: energy as u8,
                lag1_mood: mood as u8,
            },
            _ => Route::ModeA,
        }
    }

    /// The request as a master-table record
    pub fn to_record(&self) -> DailyRecord {
        let request = self.clamped();
        let mut record = DailyRecord::empty(SubjectDay::new(REQUEST_SUBJECT, 0));
        record.phase = request.phase;
        record.is_weekend = request.is_weekend;
        record.sleep_duration_minutes = request.sleep_duration_minutes;
        record.resting_heart_rate = request.resting_heart_rate;
        record.cramps = request.cramps;
        record.headaches = request.headaches;
        record.sleep_issue = request.sleep_issue;
        record.stress = request.stress;
        record
    }

    /// Encode against the Mode-A schema, extended to Mode B if routed there
    pub fn encode(&self, mode_a: &FeatureSchema) -> EncodedRequest {
        let route = self.route();
        let schema = match route.mode() {
            Mode::A => mode_a.clone(),
            Mode::B => mode_a.to_mode_b(),
        };
        EncodedRequest {
            route,
            feature_columns: schema.column_names(),
            values: schema.encode(&self.to_record(), &route.lags()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WeekendFlag {
    Bool(bool),
    Number(f64),
}

fn weekend_flag<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<WeekendFlag>::deserialize(deserializer)?.map(|flag| match flag {
        WeekendFlag::Bool(b) => f64::from(u8::from(b)),
        WeekendFlag::Number(n) => n,
    }))
}

fn clamp(name: &str, value: Option<f64>, (lo, hi): (f64, f64)) -> Option<f64> {
    let v = value?;
    if v.is_nan() {
        return None;
    }
    let clamped = v.clamp(lo, hi);
    if clamped != v {
        warn!("{name}={v} outside [{lo}, {hi}], clamped to {clamped}");
    }
    Some(clamped)
}

/// Feature vector of one request, with the columns it was encoded under
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedRequest {
    pub route: Route,
    pub feature_columns: Vec<String>,
    pub values: Vec<Option<f64>>,
}

impl EncodedRequest {
    /// Check the encoded columns against a model's registered columns
    pub fn align(&self, bundle: &ModelBundle) -> Result<&[Option<f64>], PipelineError> {
        if self.feature_columns != bundle.feature_columns {
            return Err(PipelineError::ColumnMismatch {
                model: bundle.name.clone(),
                expected: bundle.feature_columns.clone(),
                actual: self.feature_columns.clone(),
            });
        }
        Ok(&self.values)
    }
}

/// One target's prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassPrediction {
    pub model: String,
    pub class: u8,
    pub class_name: String,
    pub probabilities: Option<[f64; 3]>,
}

/// Energy and mood stability predictions for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub route: Route,
    pub energy: ClassPrediction,
    pub mood_stability: ClassPrediction,
}

/// Registered models for every (target, mode) pair
pub struct Predictor {
    mode_a: FeatureSchema,
    bundles: Vec<ModelBundle>,
}

impl Predictor {
    /// Every bundle must match the columns `mode_a` produces for its mode
    pub fn new(mode_a: FeatureSchema, bundles: Vec<ModelBundle>) -> Result<Self, PipelineError> {
        for bundle in &bundles {
            let expected = match bundle.mode {
                Mode::A => mode_a.column_names(),
                Mode::B => mode_a.to_mode_b().column_names(),
            };
            if expected != bundle.feature_columns {
                return Err(PipelineError::ColumnMismatch {
                    model: bundle.name.clone(),
                    expected: bundle.feature_columns.clone(),
                    actual: expected,
                });
            }
        }
        Ok(Self { mode_a, bundles })
    }

    pub fn predict(&self, request: &InferenceRequest) -> Result<Prediction, PipelineError> {
        let encoded = request.encode(&self.mode_a);
        let mode = encoded.route.mode();
        Ok(Prediction {
            route: encoded.route,
            energy: self.predict_target(&encoded, Target::Energy, mode)?,
            mood_stability: self.predict_target(&encoded, Target::MoodStability, mode)?,
        })
    }

    fn predict_target(
        &self,
        encoded: &EncodedRequest,
        target: Target,
        mode: Mode,
    ) -> Result<ClassPrediction, PipelineError> {
        let bundle = self
            .bundles
            .iter()
            .find(|b| b.target == target && b.mode == mode)
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "no model registered for {} {}",
                    target.slug(),
                    mode.slug()
                ))
            })?;
        let features = encoded.align(bundle)?;
        let classifier = bundle.classifier()?;
        let class = classifier.predict(features);
        let class_name = CLASS_NAMES.get(class as usize).ok_or_else(|| {
            PipelineError::Config(format!("model '{}' predicted unknown class {class}", bundle.name))
        })?;
        Ok(ClassPrediction {
            model: bundle.name.clone(),
            class,
            class_name: class_name.to_string(),
            probabilities: classifier.predict_proba(features),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_FEASIBLE_FEATURES;
    use crate::metrics::EvaluationMetrics;
    use crate::model::MAJORITY_MODEL_KIND;
    use crate::types::Field;
    use pretty_assertions::assert_eq;

    fn mode_a() -> FeatureSchema {
        let allow: Vec<String> = DEFAULT_FEASIBLE_FEATURES.iter().map(|s| s.to_string()).collect();
        FeatureSchema::mode_a(&allow, &Field::ALL.into_iter().collect()).unwrap()
    }

    fn bundle(target: Target, mode: Mode, class: u8) -> ModelBundle {
        let schema = match mode {
            Mode::A => mode_a(),
            Mode::B => mode_a().to_mode_b(),
        };
        let mut class_counts = [1, 1, 1];
        class_counts[class as usize] = 8;
        ModelBundle {
            name: format!("{}_{}", target.slug(), mode.slug()),
            target,
            mode,
            feature_columns: schema.column_names(),
            n_train: 10,
            n_test: 10,
            metrics: Some(EvaluationMetrics {
                accuracy: 0.7,
                balanced_accuracy: 0.33,
                macro_f1: 0.3,
                majority_baseline_accuracy: 0.7,
                majority_class: class,
                n_train: 10,
                n_test: 10,
            }),
            model_kind: MAJORITY_MODEL_KIND.to_string(),
            model: serde_json::json!({ "class": class, "class_counts": class_counts }),
        }
    }

    fn request() -> InferenceRequest {
        InferenceRequest {
            phase: Some("Luteal".to_string()),
            is_weekend: Some(1.0),
            sleep_duration_minutes: Some(1200.0),
            resting_heart_rate: Some(20.0),
            stress: Some(7.0),
            cramps: Some(1.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_clamping() {
        let clamped = request().clamped();
        assert_eq!(clamped.sleep_duration_minutes, Some(900.0));
        assert_eq!(clamped.resting_heart_rate, Some(35.0));
        assert_eq!(clamped.stress, Some(5.0));
        assert_eq!(clamped.cramps, Some(1.0));
        assert_eq!(clamped.headaches, None);
    }

    #[test]
    fn test_routing() {
        assert_eq!(request().route(), Route::ModeA);

        let one_lag = InferenceRequest {
            lag1_mood: Some(1.0),
            ..request()
        };
        assert_eq!(one_lag.route(), Route::ModeA);

        let both = InferenceRequest {
            lag1_mood: Some(1.0),
            lag1_energy: Some(3.4),
            ..request()
        };
        assert_eq!(
            both.route(),
            Route::ModeB {
                lag1_energy: 2,
                lag1_mood: 1
            }
        );
    }

    #[test]
    fn test_encoding_matches_training_schema() {
        let request = InferenceRequest {
            lag1_mood: Some(0.0),
            lag1_energy: Some(2.0),
            ..request()
        };
        let encoded = request.encode(&mode_a());

        assert_eq!(encoded.feature_columns, mode_a().to_mode_b().column_names());
        let value = |name: &str| {
            let idx = encoded.feature_columns.iter().position(|c| c == name).unwrap();
            encoded.values[idx]
        };
        assert_eq!(value("is_weekend"), Some(1.0));
        assert_eq!(value("sleep_duration_minutes"), Some(900.0));
        assert_eq!(value("phase_luteal"), Some(1.0));
        assert_eq!(value("phase_nan"), Some(0.0));
        assert_eq!(value("headaches_num"), None);
        assert_eq!(value("lag1_energy"), Some(2.0));
        assert_eq!(value("lag1_mood"), Some(0.0));
    }

    #[test]
    fn test_align_rejects_reordered_columns() {
        let encoded = request().encode(&mode_a());
        let mut reordered = bundle(Target::Energy, Mode::A, 1);
        reordered.feature_columns.swap(0, 1);

        let err = encoded.align(&reordered).unwrap_err();
        assert!(matches!(err, PipelineError::ColumnMismatch { .. }));
        assert!(encoded.align(&bundle(Target::Energy, Mode::A, 1)).is_ok());
    }

    #[test]
    fn test_predictor_routes_to_matching_models() {
        let bundles = vec![
            bundle(Target::Energy, Mode::A, 0),
            bundle(Target::Energy, Mode::B, 2),
            bundle(Target::MoodStability, Mode::A, 1),
            bundle(Target::MoodStability, Mode::B, 2),
        ];
        let predictor = Predictor::new(mode_a(), bundles).unwrap();

        let a = predictor.predict(&request()).unwrap();
        assert_eq!(a.energy.model, "energy_modea");
        assert_eq!(a.energy.class, 0);
        assert_eq!(a.mood_stability.class_name, "Medium");

        let b = predictor
            .predict(&InferenceRequest {
                lag1_energy: Some(1.0),
                lag1_mood: Some(1.0),
                ..request()
            })
            .unwrap();
        assert_eq!(b.route.mode(), Mode::B);
        assert_eq!(b.energy.model, "energy_modeb");
        assert_eq!(b.energy.class, 2);
        assert_eq!(b.energy.probabilities, Some([0.1, 0.1, 0.8]));
    }

    #[test]
    fn test_predictor_rejects_misaligned_bundle() {
        let mut stale = bundle(Target::Energy, Mode::A, 0);
        stale.feature_columns.pop();
        assert!(Predictor::new(mode_a(), vec![stale]).is_err());
    }

    #[test]
    fn test_missing_model_for_route() {
        let predictor = Predictor::new(mode_a(), vec![bundle(Target::Energy, Mode::A, 0)]).unwrap();
        assert!(predictor.predict(&request()).is_err());
    }

    #[test]
    fn test_is_weekend_accepts_numbers_and_bools() {
        let request: InferenceRequest =
            serde_json::from_str(r#"{"phase": "Luteal", "is_weekend": 1, "stress_num": 2}"#).unwrap();
        assert_eq!(request.is_weekend, Some(1.0));

        let request: InferenceRequest = serde_json::from_str(r#"{"is_weekend": false}"#).unwrap();
        assert_eq!(request.is_weekend, Some(0.0));

        let request: InferenceRequest = serde_json::from_str(r#"{"is_weekend": null}"#).unwrap();
        assert_eq!(request.is_weekend, None);

        let request: InferenceRequest = serde_json::from_str(r#"{"is_weekend": 4}"#).unwrap();
        assert_eq!(request.clamped().is_weekend, Some(1.0));
        assert!(serde_json::from_str::<InferenceRequest>(r#"{"is_weekend": "yes"}"#).is_err());
    }

    #[test]
    fn test_unknown_predicted_class_is_an_error() {
        let mut bad = bundle(Target::Energy, Mode::A, 0);
        bad.model = serde_json::json!({ "class": 5, "class_counts": [1, 1, 1] });
        let bundles = vec![bad, bundle(Target::MoodStability, Mode::A, 1)];
        let predictor = Predictor::new(mode_a(), bundles).unwrap();

        assert!(predictor.predict(&request()).is_err());
    }

    #[test]
    fn test_request_json_uses_column_names() {
        let json = r#"{"phase": "Menstrual", "stress_num": 2, "resting_heart_rate__value": 61.5, "lag1_energy": 1}"#;
        let request: InferenceRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.stress, Some(2.0));
        assert_eq!(request.resting_heart_rate, Some(61.5));
        assert_eq!(request.route(), Route::ModeA);
    }
}

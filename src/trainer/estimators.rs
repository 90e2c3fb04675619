//! Pluggable link travel time estimators. Model names resolve through a
//! capability registry built once at startup, unknown names fail fast.

use super::TrainerError;
use ahash::AHashMap;
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

const WEEK_SECONDS: f64 = 7.0 * 24.0 * 3600.0;
const HOURS_PER_WEEK: usize = 7 * 24;

pub trait LinkTravelTimeModel: Send {
    fn fit(&mut self, index: &[DateTime<Utc>], values: &[f64]) -> Result<(), TrainerError>;
    fn predict(&self, time: DateTime<Utc>) -> f64;
    fn to_bytes(&self) -> Result<Vec<u8>, TrainerError>;
}

fn seconds_into_week(time: DateTime<Utc>) -> f64 {
    let day = time.weekday().num_days_from_monday() as f64;
    day * 24.0 * 3600.0 + time.num_seconds_from_midnight() as f64
}

/// Mean travel time per hour of the week, falling back to the overall mean
/// for hours without samples.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WeeklyHistoricalAverage {
    hour_means: Vec<Option<f64>>,
    overall_mean: f64,
}

impl LinkTravelTimeModel for WeeklyHistoricalAverage {
    fn fit(&mut self, index: &[DateTime<Utc>], values: &[f64]) -> Result<(), TrainerError> {
        if index.is_empty() || index.len() != values.len() {
            return Err(TrainerError::Fit(format!(
                "historical average needs aligned samples, got {} timestamps and {} values",
                index.len(),
                values.len()
            )));
        }

        let mut sums = vec![0.0_f64; HOURS_PER_WEEK];
        let mut counts = vec![0usize; HOURS_PER_WEEK];
        for (time, value) in index.iter().zip(values.iter()) {
            let hour = (seconds_into_week(*time) / 3600.0) as usize % HOURS_PER_WEEK;
            sums[hour] += value;
            counts[hour] += 1;
        }

        self.overall_mean = values.iter().sum::<f64>() / values.len() as f64;
        self.hour_means = sums
            .iter()
            .zip(counts.iter())
            .map(|(sum, count)| match count {
                0 => None,
                count => Some(sum / *count as f64),
            })
            .collect();
        Ok(())
    }

    fn predict(&self, time: DateTime<Utc>) -> f64 {
        let hour = (seconds_into_week(time) / 3600.0) as usize % HOURS_PER_WEEK;
        self.hour_means
            .get(hour)
            .copied()
            .flatten()
            .unwrap_or(self.overall_mean)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, TrainerError> {
        Ok(crate::bincode_serialize(self)?)
    }
}

/// Seasonal regression over the weekly cycle: least-squares projection of
/// the samples onto low-order weekly harmonics plus an intercept.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SeasonalRegression {
    intercept: f64,
    cos_terms: Vec<f64>,
    sin_terms: Vec<f64>,
}

const HARMONICS: usize = 3;

impl LinkTravelTimeModel for SeasonalRegression {
    fn fit(&mut self, index: &[DateTime<Utc>], values: &[f64]) -> Result<(), TrainerError> {
        if index.is_empty() || index.len() != values.len() {
            return Err(TrainerError::Fit(format!(
                "seasonal regression needs aligned samples, got {} timestamps and {} values",
                index.len(),
                values.len()
            )));
        }

        let n = values.len() as f64;
        self.intercept = values.iter().sum::<f64>() / n;

        self.cos_terms = Vec::with_capacity(HARMONICS);
        self.sin_terms = Vec::with_capacity(HARMONICS);
        for k in 1..=HARMONICS {
            let omega = 2.0 * std::f64::consts::PI * k as f64 / WEEK_SECONDS;
            let mut cos_sum = 0.0;
            let mut sin_sum = 0.0;
            for (time, value) in index.iter().zip(values.iter()) {
                let centered = value - self.intercept;
                let phase = omega * seconds_into_week(*time);
                cos_sum += centered * phase.cos();
                sin_sum += centered * phase.sin();
            }
            self.cos_terms.push(2.0 * cos_sum / n);
            self.sin_terms.push(2.0 * sin_sum / n);
        }
        Ok(())
    }

    fn predict(&self, time: DateTime<Utc>) -> f64 {
        let mut prediction = self.intercept;
        for (k, (cos_term, sin_term)) in
            self.cos_terms.iter().zip(self.sin_terms.iter()).enumerate()
        {
            let omega = 2.0 * std::f64::consts::PI * (k + 1) as f64 / WEEK_SECONDS;
            let phase = omega * seconds_into_week(time);
            prediction += cos_term * phase.cos() + sin_term * phase.sin();
        }
        prediction
    }

    fn to_bytes(&self) -> Result<Vec<u8>, TrainerError> {
        Ok(crate::bincode_serialize(self)?)
    }
}

type EstimatorFactory = fn() -> Box<dyn LinkTravelTimeModel>;

pub struct EstimatorRegistry {
    factories: AHashMap<String, EstimatorFactory>,
}

impl EstimatorRegistry {
    pub fn with_defaults() -> EstimatorRegistry {
        let mut registry = EstimatorRegistry {
            factories: AHashMap::new(),
        };
        registry.insert("ha", || Box::new(WeeklyHistoricalAverage::default()));
        registry.insert("srm", || Box::new(SeasonalRegression::default()));
        registry
    }

    pub fn insert(&mut self, name: &str, factory: EstimatorFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn LinkTravelTimeModel>, TrainerError> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(TrainerError::UnknownModel(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn weekly_series() -> (Vec<DateTime<Utc>>, Vec<f64>) {
        // Three weeks of hourly samples: slow mornings, fast nights
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut index = Vec::new();
        let mut values = Vec::new();
        for hour in 0..(3 * 7 * 24) {
            let time = start + chrono::Duration::hours(hour);
            index.push(time);
            values.push(if time.hour() == 8 { 180.0 } else { 100.0 });
        }
        (index, values)
    }

    #[test]
    fn historical_average_learns_hourly_profile() {
        let (index, values) = weekly_series();
        let mut model = WeeklyHistoricalAverage::default();
        model.fit(&index, &values).unwrap();

        let morning = Utc.with_ymd_and_hms(2024, 2, 5, 8, 30, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 2, 5, 2, 30, 0).unwrap();
        assert_eq!(model.predict(morning), 180.0);
        assert_eq!(model.predict(night), 100.0);
    }

    #[test]
    fn historical_average_rejects_empty_series() {
        let mut model = WeeklyHistoricalAverage::default();
        let result = model.fit(&[], &[]);
        assert!(matches!(result, Err(TrainerError::Fit(_))));
    }

    #[test]
    fn seasonal_regression_is_flat_for_constant_series() {
        let (index, _) = weekly_series();
        let values = vec![120.0; index.len()];
        let mut model = SeasonalRegression::default();
        model.fit(&index, &values).unwrap();

        let any_time = Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap();
        assert!((model.predict(any_time) - 120.0).abs() < 1e-6);
    }

    #[test]
    fn fitted_models_serialize() {
        let (index, values) = weekly_series();
        let mut model = SeasonalRegression::default();
        model.fit(&index, &values).unwrap();
        let bytes = model.to_bytes().unwrap();
        assert!(!bytes.is_empty());

        let restored: SeasonalRegression = crate::bincode_deserialize(&bytes).unwrap();
        let probe = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(model.predict(probe), restored.predict(probe));
    }

    #[test]
    fn registry_resolves_known_models_and_rejects_unknown() {
        let registry = EstimatorRegistry::with_defaults();
        assert!(registry.create("ha").is_ok());
        assert!(registry.create("srm").is_ok());
        assert!(matches!(
            registry.create("gradient-boosted-unicorn"),
            Err(TrainerError::UnknownModel(_))
        ));
    }
}

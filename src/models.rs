// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a tracked journey. Transitions are forward-only,
/// `Completed` is terminal.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum JourneyState {
    #[default]
    Scheduled,
    Run,
    Dwell,
    Completed,
}

impl JourneyState {
    fn rank(self) -> u8 {
        match self {
            JourneyState::Scheduled => 0,
            JourneyState::Run => 1,
            JourneyState::Dwell => 2,
            JourneyState::Completed => 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Journey {
    pub journey_ref: String,
    pub line_designation: String,
    pub planned_start_date_time: DateTime<Utc>,
    pub planned_end_date_time: DateTime<Utc>,
    pub origin: String,
    pub destination: String,
    #[serde(default)]
    pub vehicle_ref: Option<String>,
    #[serde(default)]
    pub vehicle_valid_from_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vehicle_valid_to_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: JourneyState,
    #[serde(default)]
    pub link_index: usize,
    #[serde(default)]
    pub current_distance: f64,
    #[serde(default)]
    pub total_distance: f64,
    #[serde(default)]
    pub link_error_acc: f64,
    #[serde(default)]
    pub delay: f64,
    #[serde(default)]
    pub stops: Vec<Stop>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub added: Option<DateTime<Utc>>,
}

impl Journey {
    /// Moves the lifecycle state forward. A transition to an earlier or
    /// equal state is ignored, `Completed` can never be left.
    pub fn advance_state(&mut self, next: JourneyState) {
        if next.rank() > self.state.rank() {
            self.state = next;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub sequence_number: u32,
    pub link_ref: String,
    pub planned_time: f64,
    pub total_distance: f64,
    #[serde(default)]
    pub observed_time: Option<f64>,
    #[serde(default)]
    pub predicted_time: Option<f64>,
    #[serde(default)]
    pub predicted_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub predictions: Vec<Prediction>,
    #[serde(default)]
    pub error: Option<f64>,
    #[serde(default)]
    pub error_acc: Option<f64>,
    #[serde(default)]
    pub vehicle_ref: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub sequence_number: u32,
    pub stop_point_ref: String,
    pub planned_departure_utc: DateTime<Utc>,
    #[serde(default)]
    pub observed_arrival_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub predicted_arrival_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub observed_departure_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub predicted_departure_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub predicted_dwell_time: Option<f64>,
    #[serde(default)]
    pub predicted_updated: Option<DateTime<Utc>>,
}

/// One point estimate returned by the predictor, kept on the link so the
/// error can be filled in once the observed travel time arrives.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub predicted: f64,
    #[serde(default)]
    pub error: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Summary projection served by the `journeys` service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JourneySummary {
    pub journey_ref: String,
    pub line_designation: String,
    pub planned_start_date_time: DateTime<Utc>,
    pub planned_end_date_time: DateTime<Utc>,
    pub origin: String,
    pub destination: String,
    pub vehicle_ref: Option<String>,
    pub state: JourneyState,
    pub delay: f64,
    pub current_distance: f64,
    pub total_distance: f64,
}

impl From<&Journey> for JourneySummary {
    fn from(journey: &Journey) -> Self {
        JourneySummary {
            journey_ref: journey.journey_ref.clone(),
            line_designation: journey.line_designation.clone(),
            planned_start_date_time: journey.planned_start_date_time,
            planned_end_date_time: journey.planned_end_date_time,
            origin: journey.origin.clone(),
            destination: journey.destination.clone(),
            vehicle_ref: journey.vehicle_ref.clone(),
            state: journey.state,
            delay: journey.delay,
            current_distance: journey.current_distance,
            total_distance: journey.total_distance,
        }
    }
}

/// Decoded link geometry, cached once per link ref for the process lifetime.
pub struct LinkGeometry {
    pub link_ref: String,
    pub line: geo_types::LineString<f64>,
}

/// Wire form of one link geometry as returned by `load_link_geometry`:
/// one or more encoded polyline parts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkGeometryPayload {
    pub link_ref: String,
    pub polylines: Vec<String>,
}

// Inbound domain event payloads. Handlers deserialize the bus payload into
// these and discard events that do not parse.

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleJourneyAssignmentEvent {
    pub vehicle_journey_assignment: VehicleJourneyAssignment,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleJourneyAssignment {
    pub journey_ref: String,
    pub vehicle_ref: String,
    #[serde(default)]
    pub valid_from_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invalid_from_utc: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkCompletedEvent {
    pub journey_ref: String,
    pub sequence_number: u32,
    pub link_ref: String,
    pub travel_time_seconds: f64,
    pub vehicle_ref: String,
}

/// Payload of `departure` (observed) and `estimated_departure` (derived)
/// events. Which timestamp applies is decided by the event type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepartureEvent {
    pub journey_ref: String,
    pub sequence_number: u32,
    #[serde(default)]
    pub observed_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_utc: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrivalEvent {
    pub journey_ref: String,
    pub sequence_number: u32,
    #[serde(default)]
    pub observed_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: Option<ArrivalState>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ArrivalState {
    #[serde(rename = "ARRIVED")]
    Arrived,
    #[serde(rename = "PASSED")]
    Passed,
}

/// Metadata record persisted next to each trained model artifact,
/// addressed by the training content hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetadata {
    pub hash: String,
    pub model: String,
    pub link_ref: String,
    pub time: DateTime<Utc>,
    pub trained: DateTime<Utc>,
    pub resource_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainModelRequest {
    pub link_ref: String,
    pub model: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TrainingJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJob {
    pub job_id: Uuid,
    pub request: TrainModelRequest,
    pub status: TrainingJobStatus,
    #[serde(default)]
    pub result: Option<ModelMetadata>,
    #[serde(default)]
    pub error: Option<String>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_only_advances() {
        let mut journey = test_journey();
        journey.advance_state(JourneyState::Run);
        assert_eq!(journey.state, JourneyState::Run);
        journey.advance_state(JourneyState::Dwell);
        assert_eq!(journey.state, JourneyState::Dwell);
        // A later departure must not move the journey backwards
        journey.advance_state(JourneyState::Run);
        assert_eq!(journey.state, JourneyState::Dwell);
        journey.advance_state(JourneyState::Completed);
        journey.advance_state(JourneyState::Scheduled);
        assert_eq!(journey.state, JourneyState::Completed);
    }

    #[test]
    fn journey_deserializes_from_header_fields_only() {
        let value = serde_json::json!({
            "journeyRef": "J1",
            "lineDesignation": "4A",
            "plannedStartDateTime": "2024-01-01T08:00:00Z",
            "plannedEndDateTime": "2024-01-01T09:00:00Z",
            "origin": "North",
            "destination": "South"
        });
        let journey: Journey = serde_json::from_value(value).unwrap();
        assert_eq!(journey.state, JourneyState::Scheduled);
        assert_eq!(journey.link_index, 0);
        assert!(journey.links.is_empty());
        assert!(journey.vehicle_ref.is_none());
    }

    fn test_journey() -> Journey {
        Journey {
            journey_ref: "J1".to_string(),
            line_designation: "4A".to_string(),
            planned_start_date_time: Utc::now(),
            planned_end_date_time: Utc::now(),
            origin: "North".to_string(),
            destination: "South".to_string(),
            vehicle_ref: None,
            vehicle_valid_from_utc: None,
            vehicle_valid_to_utc: None,
            state: JourneyState::Scheduled,
            link_index: 0,
            current_distance: 0.0,
            total_distance: 0.0,
            link_error_acc: 0.0,
            delay: 0.0,
            stops: vec![],
            links: vec![],
            added: None,
        }
    }
}

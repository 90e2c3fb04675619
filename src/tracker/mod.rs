// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

//! Journey tracking: ingests vehicle/journey events, advances per-journey
//! progress state and cascades re-estimated arrival/departure times through
//! the remainder of each journey. Also serves the read-only query facade
//! and runs the periodic journey refresh.

use crate::config::AppConfig;
use crate::events::{EventBus, EventHandler, Subscription};
use crate::journey_store::JourneyStore;
use crate::models::{
    ArrivalEvent, ArrivalState, DepartureEvent, Journey, JourneyState, LinkCompletedEvent,
    LinkGeometry, LinkGeometryPayload, Prediction, VehicleJourneyAssignmentEvent,
};
use crate::services::{ServiceError, ServiceHandler, ServiceRegistry};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

pub struct JourneyTracker {
    bus: Arc<EventBus>,
    services: Arc<ServiceRegistry>,
    store: Arc<JourneyStore>,
    stop_points: DashMap<String, Value>,
    link_geometries: DashMap<String, LinkGeometry>,
    config: AppConfig,
    subscriptions: Mutex<Vec<Subscription>>,
}

enum ArrivalOutcome {
    NoStop,
    Suppressed,
    FinalStop,
    Cascade(DateTime<Utc>),
}

impl JourneyTracker {
    pub fn new(
        bus: Arc<EventBus>,
        services: Arc<ServiceRegistry>,
        store: Arc<JourneyStore>,
        config: AppConfig,
    ) -> Arc<JourneyTracker> {
        Arc::new(JourneyTracker {
            bus,
            services,
            store,
            stop_points: DashMap::new(),
            link_geometries: DashMap::new(),
            config,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Wires the tracker into the bus and service registry.
    pub fn attach(self: &Arc<Self>) {
        self.subscribe_handlers();
        self.register_services();
    }

    /// Full setup for the running service: attach and start the periodic
    /// refresh loop.
    pub async fn setup(
        bus: Arc<EventBus>,
        services: Arc<ServiceRegistry>,
        store: Arc<JourneyStore>,
        config: AppConfig,
    ) -> Arc<JourneyTracker> {
        let tracker = JourneyTracker::new(bus, services, store, config);
        tracker.attach();
        tracker.spawn_refresh();
        tracker
    }

    pub fn spawn_refresh(self: &Arc<Self>) {
        let tracker = self.clone();
        tokio::spawn(async move {
            tracker.fetch_stop_points().await;
            let mut interval = tokio::time::interval(tracker.config.refresh_interval);
            loop {
                interval.tick().await;
                tracker.refresh_journeys().await;
            }
        });
    }

    fn subscribe_handlers(self: &Arc<Self>) {
        let mut subscriptions = Vec::new();

        let tracker = self.clone();
        let handler: EventHandler = Arc::new(move |_event_type, payload| {
            let tracker = tracker.clone();
            Box::pin(async move { tracker.handle_vehicle_assignment(payload).await })
        });
        subscriptions.push(self.bus.subscribe("vehicleJourneyAssignment", handler));

        let tracker = self.clone();
        let handler: EventHandler = Arc::new(move |_event_type, payload| {
            let tracker = tracker.clone();
            Box::pin(async move { tracker.handle_link_completed(payload).await })
        });
        subscriptions.push(self.bus.subscribe("linkCompleted", handler));

        for event_type in ["departure", "estimated_departure"] {
            let tracker = self.clone();
            let handler: EventHandler = Arc::new(move |event_type, payload| {
                let tracker = tracker.clone();
                Box::pin(async move { tracker.handle_departure(&event_type, payload).await })
            });
            subscriptions.push(self.bus.subscribe(event_type, handler));
        }

        for event_type in ["arrival", "estimated_arrival"] {
            let tracker = self.clone();
            let handler: EventHandler = Arc::new(move |event_type, payload| {
                let tracker = tracker.clone();
                Box::pin(async move { tracker.handle_arrival(&event_type, payload).await })
            });
            subscriptions.push(self.bus.subscribe(event_type, handler));
        }

        self.subscriptions.lock().unwrap().extend(subscriptions);
    }

    fn register_services(self: &Arc<Self>) {
        let tracker = self.clone();
        let handler: ServiceHandler = Arc::new(move |_payload| {
            let tracker = tracker.clone();
            Box::pin(async move {
                let summaries = tracker.store.summaries().await;
                serde_json::to_value(summaries).map_err(|e| ServiceError::handler("journeys", e))
            })
        });
        self.services.register("journeys", handler);

        let tracker = self.clone();
        let handler: ServiceHandler = Arc::new(move |payload| {
            let tracker = tracker.clone();
            Box::pin(async move {
                let journey_ref = payload.get("journeyRef").and_then(Value::as_str);
                match journey_ref {
                    Some(journey_ref) => match tracker.store.get(journey_ref).await {
                        Some(journey) => serde_json::to_value(journey)
                            .map_err(|e| ServiceError::handler("journey_details", e)),
                        None => Ok(Value::Null),
                    },
                    None => Ok(Value::Null),
                }
            })
        });
        self.services.register("journey_details", handler);

        let tracker = self.clone();
        let handler: ServiceHandler = Arc::new(move |payload| {
            let tracker = tracker.clone();
            Box::pin(async move { Ok(tracker.stop_points_view(&payload).await) })
        });
        self.services.register("stop_points", handler);

        let tracker = self.clone();
        let handler: ServiceHandler = Arc::new(move |payload| {
            let tracker = tracker.clone();
            Box::pin(async move { Ok(tracker.link_geometries_view(&payload).await) })
        });
        self.services.register("link_geometries", handler);
    }

    // Event handlers

    async fn handle_vehicle_assignment(&self, payload: Value) {
        let event: VehicleJourneyAssignmentEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Discarding malformed vehicleJourneyAssignment event: {}", e);
                return;
            }
        };
        let assignment = event.vehicle_journey_assignment;

        let applied = self
            .store
            .with_journey_mut(&assignment.journey_ref, |journey| {
                journey.vehicle_ref = Some(assignment.vehicle_ref.clone());
                journey.vehicle_valid_from_utc = assignment.valid_from_utc;
                journey.vehicle_valid_to_utc = assignment.invalid_from_utc;

                // An invalidated assignment close to the end of the link
                // sequence means the journey is done.
                if assignment.invalid_from_utc.is_some()
                    && journey.link_index + 2 >= journey.links.len()
                {
                    journey.advance_state(JourneyState::Completed);
                }
            })
            .await;

        if applied.is_none() {
            debug!(
                "vehicleJourneyAssignment for untracked journey {}",
                assignment.journey_ref
            );
        }
    }

    async fn handle_link_completed(&self, payload: Value) {
        let event: LinkCompletedEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Discarding malformed linkCompleted event: {}", e);
                return;
            }
        };

        let applied = self
            .store
            .with_journey_mut(&event.journey_ref, |journey| {
                journey.vehicle_ref = Some(event.vehicle_ref.clone());

                let Some(ix) = journey
                    .links
                    .iter()
                    .position(|link| link.sequence_number == event.sequence_number)
                else {
                    warn!(
                        "Could not find link for journey: {}, sequence_number: {}",
                        event.journey_ref, event.sequence_number
                    );
                    return;
                };

                if journey.links[ix].link_ref != event.link_ref {
                    warn!(
                        "Link refs do not match for journey: {}, sequence_number: {}. Expected {}, found {}",
                        event.journey_ref,
                        event.sequence_number,
                        event.link_ref,
                        journey.links[ix].link_ref
                    );
                    return;
                }

                // Replays of an already-observed link must not double-count
                // the error accumulators.
                if journey.links[ix].observed_time.is_some() {
                    debug!(
                        "Duplicate linkCompleted for journey: {}, sequence_number: {} ignored",
                        event.journey_ref, event.sequence_number
                    );
                    return;
                }

                {
                    let link = &mut journey.links[ix];
                    link.vehicle_ref = Some(event.vehicle_ref.clone());
                    link.observed_time = Some(event.travel_time_seconds);
                    for prediction in &mut link.predictions {
                        prediction.error = Some(event.travel_time_seconds - prediction.predicted);
                    }
                }

                if let Some(predicted) = journey.links[ix].predicted_time {
                    let error = event.travel_time_seconds - predicted;
                    journey.links[ix].error = Some(error);
                    journey.links[ix].error_acc = Some(journey.link_error_acc + error);
                    journey.link_error_acc += error;
                }

                let last_ix = journey.links.len() - 1;
                journey.link_index = (ix + 1).min(last_ix);
                journey.current_distance = journey.links[ix].total_distance;
            })
            .await;

        if applied.is_none() {
            debug!("linkCompleted for untracked journey {}", event.journey_ref);
        }
    }

    async fn handle_departure(&self, event_type: &str, payload: Value) {
        let event: DepartureEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Discarding malformed {} event: {}", event_type, e);
                return;
            }
        };
        let observed = event_type == "departure";
        let departure_time = if observed {
            event.observed_utc
        } else {
            event.estimated_utc
        };
        let Some(departure_time) = departure_time else {
            warn!(
                "Discarding {} event without a timestamp for journey {}",
                event_type, event.journey_ref
            );
            return;
        };

        // Resolve the target link before blocking on the predictor, then
        // commit every field write in one exclusive-lock pass afterwards.
        let target = self
            .store
            .with_journey(&event.journey_ref, |journey| {
                let link = journey
                    .links
                    .iter()
                    .find(|link| link.sequence_number >= event.sequence_number)?;
                journey
                    .stops
                    .iter()
                    .find(|stop| stop.sequence_number >= event.sequence_number)?;
                Some((link.link_ref.clone(), link.planned_time))
            })
            .await;

        let (link_ref, planned_time) = match target {
            Some(Some(target)) => target,
            Some(None) => {
                warn!(
                    "Could not find link/stop for journey: {}, sequence_number: {}",
                    event.journey_ref, event.sequence_number
                );
                return;
            }
            None => {
                debug!("{} for untracked journey {}", event_type, event.journey_ref);
                return;
            }
        };

        let candidates = self.link_predict(&link_ref, departure_time).await;
        let predicted = match candidates.first() {
            // The first candidate is authoritative
            Some(candidate) => candidate.predicted,
            // Fallback to timetable
            None => planned_time,
        };

        let committed = self
            .store
            .with_journey_mut(&event.journey_ref, |journey| {
                if observed {
                    journey.advance_state(JourneyState::Run);
                    if let Some(stop) = journey
                        .stops
                        .iter_mut()
                        .find(|stop| stop.sequence_number >= event.sequence_number)
                    {
                        stop.observed_departure_utc = Some(departure_time);
                        let delay = departure_time - stop.planned_departure_utc;
                        journey.delay = delay.num_milliseconds() as f64 / 1000.0;
                    }
                }

                match journey
                    .links
                    .iter_mut()
                    .find(|link| link.sequence_number >= event.sequence_number)
                {
                    Some(link) => {
                        link.predicted_time = Some(predicted);
                        link.predicted_updated = Some(Utc::now());
                        link.predictions = candidates.clone();
                        true
                    }
                    None => false,
                }
            })
            .await;

        if committed != Some(true) {
            return;
        }

        self.bus.publish(
            "estimated_arrival",
            json!({
                "journeyRef": event.journey_ref,
                "sequenceNumber": event.sequence_number + 1,
                "estimatedUtc": departure_time + seconds_duration(predicted),
            }),
        );
    }

    async fn handle_arrival(&self, event_type: &str, payload: Value) {
        let event: ArrivalEvent = match serde_json::from_value(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Discarding malformed {} event: {}", event_type, e);
                return;
            }
        };
        let observed = event_type == "arrival";
        let arrival_time = if observed {
            event.observed_utc
        } else {
            event.estimated_utc
        };
        let Some(arrival_time) = arrival_time else {
            warn!(
                "Discarding {} event without a timestamp for journey {}",
                event_type, event.journey_ref
            );
            return;
        };

        let dwell = self.config.dwell_baseline_seconds;
        let outcome = self
            .store
            .with_journey_mut(&event.journey_ref, |journey| {
                if observed && event.state == Some(ArrivalState::Arrived) {
                    journey.advance_state(JourneyState::Dwell);
                }

                let stop_count = journey.stops.len();
                let Some((ix, stop)) = journey
                    .stops
                    .iter_mut()
                    .enumerate()
                    .find(|(_, stop)| stop.sequence_number >= event.sequence_number)
                else {
                    return ArrivalOutcome::NoStop;
                };

                if observed {
                    stop.observed_arrival_utc = Some(arrival_time);
                    // Ignore passed arrivals, the update will cascade from
                    // the corresponding departure.
                    if event.state == Some(ArrivalState::Passed) {
                        return ArrivalOutcome::Suppressed;
                    }
                } else {
                    stop.predicted_arrival_utc = Some(arrival_time);
                }

                stop.predicted_dwell_time = Some(dwell);
                stop.predicted_departure_utc = Some(arrival_time + seconds_duration(dwell));
                stop.predicted_updated = Some(Utc::now());

                if ix < stop_count - 1 {
                    ArrivalOutcome::Cascade(arrival_time + seconds_duration(dwell))
                } else {
                    ArrivalOutcome::FinalStop
                }
            })
            .await;

        match outcome {
            Some(ArrivalOutcome::Cascade(estimated_departure)) => {
                self.bus.publish(
                    "estimated_departure",
                    json!({
                        "journeyRef": event.journey_ref,
                        "sequenceNumber": event.sequence_number,
                        "estimatedUtc": estimated_departure,
                    }),
                );
            }
            Some(ArrivalOutcome::NoStop) => {
                warn!(
                    "Could not find stop for journey: {}, sequence_number: {}",
                    event.journey_ref, event.sequence_number
                );
            }
            Some(ArrivalOutcome::Suppressed) | Some(ArrivalOutcome::FinalStop) => {}
            None => {
                debug!("{} for untracked journey {}", event_type, event.journey_ref);
            }
        }
    }

    async fn link_predict(&self, link_ref: &str, time: DateTime<Utc>) -> Vec<Prediction> {
        let payload = json!({ "linkRef": link_ref, "time": time });
        match self
            .services
            .call_with_timeout("link_predict", payload, self.config.rpc_timeout)
            .await
        {
            Ok(value) => match serde_json::from_value::<Vec<Prediction>>(value) {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!("Unreadable link_predict response for '{}': {}", link_ref, e);
                    Vec::new()
                }
            },
            Err(e) => {
                warn!("link_predict failed for '{}': {}", link_ref, e);
                Vec::new()
            }
        }
    }

    // Query facade views

    async fn stop_points_view(&self, payload: &Value) -> Value {
        if let Some(journey_ref) = payload.get("journeyRef").and_then(Value::as_str) {
            match self.store.get(journey_ref).await {
                Some(journey) => Value::Array(
                    journey
                        .stops
                        .iter()
                        .map(|stop| {
                            self.stop_points
                                .get(&stop.stop_point_ref)
                                .map(|entry| entry.value().clone())
                                .unwrap_or(Value::Null)
                        })
                        .collect(),
                ),
                None => Value::Null,
            }
        } else {
            Value::Array(
                self.stop_points
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect(),
            )
        }
    }

    async fn link_geometries_view(&self, payload: &Value) -> Value {
        if let Some(journey_ref) = payload.get("journeyRef").and_then(Value::as_str) {
            match self.store.get(journey_ref).await {
                Some(journey) => Value::Array(
                    journey
                        .links
                        .iter()
                        .map(|link| self.link_geometry_view(&link.link_ref))
                        .collect(),
                ),
                None => Value::Null,
            }
        } else {
            Value::Array(
                self.link_geometries
                    .iter()
                    .map(|entry| self.link_geometry_view(entry.key()))
                    .collect(),
            )
        }
    }

    fn link_geometry_view(&self, link_ref: &str) -> Value {
        match self.link_geometries.get(link_ref) {
            Some(entry) => {
                let geometry = entry.value();
                // Coordinate axes swapped to lat/lon order for display
                let coords: Vec<Value> = geometry
                    .line
                    .0
                    .iter()
                    .map(|coord| json!([coord.y, coord.x]))
                    .collect();
                json!({
                    "linkRef": geometry.link_ref,
                    "coords": coords,
                })
            }
            None => Value::Null,
        }
    }

    // Background refresh

    pub async fn fetch_stop_points(&self) {
        match self
            .services
            .call_with_timeout("load_stop_points", Value::Null, self.config.rpc_timeout)
            .await
        {
            Ok(Value::Array(items)) => {
                self.stop_points.clear();
                for item in items {
                    if let Some(stop_point_ref) = item.get("stopPointRef") {
                        self.stop_points.insert(ref_key(stop_point_ref), item.clone());
                    }
                }
                info!("Loaded {} stop points", self.stop_points.len());
            }
            Ok(other) => {
                warn!("Unexpected load_stop_points response: {}", other);
            }
            Err(e) => {
                warn!("load_stop_points failed: {}", e);
            }
        }
    }

    /// One refresh cycle: pick up new journeys from the transit-data
    /// service, evict finished ones, fill the geometry cache and write the
    /// durable snapshot.
    pub async fn refresh_journeys(&self) {
        let mut new_journeys = 0usize;

        match self
            .services
            .call_with_timeout(
                "load_journeys",
                json!({ "fromDateTime": Utc::now() }),
                self.config.rpc_timeout,
            )
            .await
        {
            Ok(Value::Array(items)) => {
                for item in items {
                    match serde_json::from_value::<Journey>(item) {
                        Ok(journey) => {
                            if !self.store.contains(&journey.journey_ref).await
                                && self.insert_journey(journey).await
                            {
                                new_journeys += 1;
                            }
                        }
                        Err(e) => {
                            warn!("Skipping unreadable journey from load_journeys: {}", e);
                        }
                    }
                }
            }
            Ok(other) => {
                warn!("Unexpected load_journeys response: {}", other);
            }
            Err(e) => {
                warn!("load_journeys failed: {}", e);
            }
        }

        let removed_journeys = self.evict_expired().await;
        self.fetch_missing_geometries().await;

        info!(
            "Loaded {} new journeys, removed {} journeys",
            new_journeys, removed_journeys
        );

        if let Err(e) = self.store.write_snapshot(&self.config.snapshot_path).await {
            warn!("Failed to write journey snapshot: {}", e);
        }
    }

    async fn insert_journey(&self, mut journey: Journey) -> bool {
        let stops = self
            .fetch_journey_sequence::<crate::models::Stop>("load_journey_stops", &journey.journey_ref)
            .await;
        let links = self
            .fetch_journey_sequence::<crate::models::Link>("load_journey_links", &journey.journey_ref)
            .await;

        let (Some(stops), Some(links)) = (stops, links) else {
            return false;
        };
        let Some(last_link) = links.last() else {
            warn!(
                "Journey {} has no links, not tracking it",
                journey.journey_ref
            );
            return false;
        };

        journey.total_distance = last_link.total_distance;
        journey.stops = stops;
        journey.links = links;
        journey.added = Some(Utc::now());
        self.store.upsert(journey).await;
        true
    }

    async fn fetch_journey_sequence<T: serde::de::DeserializeOwned>(
        &self,
        service: &str,
        journey_ref: &str,
    ) -> Option<Vec<T>> {
        match self
            .services
            .call_with_timeout(
                service,
                json!({ "journeyRef": journey_ref }),
                self.config.rpc_timeout,
            )
            .await
        {
            Ok(value) => match serde_json::from_value::<Vec<T>>(value) {
                Ok(items) => Some(items),
                Err(e) => {
                    warn!(
                        "Unreadable {} response for journey {}: {}",
                        service, journey_ref, e
                    );
                    None
                }
            },
            Err(e) => {
                warn!("{} failed for journey {}: {}", service, journey_ref, e);
                None
            }
        }
    }

    async fn evict_expired(&self) -> usize {
        let grace = chrono::Duration::from_std(self.config.eviction_grace)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let horizon = Utc::now() - grace;

        let expired: Vec<String> = self
            .store
            .map_journeys(|journey| {
                (journey.journey_ref.clone(), journey.planned_end_date_time)
            })
            .await
            .into_iter()
            .filter(|(_, planned_end)| *planned_end < horizon)
            .map(|(journey_ref, _)| journey_ref)
            .collect();

        let mut removed = 0usize;
        for journey_ref in &expired {
            if self.store.remove(journey_ref).await {
                removed += 1;
            }
        }
        removed
    }

    async fn fetch_missing_geometries(&self) {
        let targets: Vec<String> = self
            .store
            .map_journeys(|journey| {
                let missing = journey
                    .links
                    .iter()
                    .any(|link| !self.link_geometries.contains_key(&link.link_ref));
                missing.then(|| journey.journey_ref.clone())
            })
            .await
            .into_iter()
            .flatten()
            .collect();

        for journey_ref in targets {
            let response = self
                .services
                .call_with_timeout(
                    "load_link_geometry",
                    json!({ "journeyRef": journey_ref }),
                    self.config.rpc_timeout,
                )
                .await;
            let payloads = match response {
                Ok(value) => match serde_json::from_value::<Vec<LinkGeometryPayload>>(value) {
                    Ok(payloads) => payloads,
                    Err(e) => {
                        warn!(
                            "Unreadable load_link_geometry response for journey {}: {}",
                            journey_ref, e
                        );
                        continue;
                    }
                },
                Err(e) => {
                    warn!("load_link_geometry failed for journey {}: {}", journey_ref, e);
                    continue;
                }
            };

            for payload in payloads {
                if self.link_geometries.contains_key(&payload.link_ref) {
                    continue;
                }
                if let Some(geometry) = decode_link_geometry(&payload) {
                    self.link_geometries.insert(payload.link_ref.clone(), geometry);
                }
            }
        }
    }
}

/// Flattens the polyline-encoded parts of one link geometry into a single
/// coordinate sequence.
fn decode_link_geometry(payload: &LinkGeometryPayload) -> Option<LinkGeometry> {
    let mut coords: Vec<geo_types::Coord<f64>> = Vec::new();
    for part in &payload.polylines {
        match polyline::decode_polyline(part, 5) {
            Ok(line) => coords.extend(line.0),
            Err(e) => {
                warn!("Failed to decode geometry for link {}: {}", payload.link_ref, e);
                return None;
            }
        }
    }
    Some(LinkGeometry {
        link_ref: payload.link_ref.clone(),
        line: geo_types::LineString::from(coords),
    })
}

fn seconds_duration(seconds: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((seconds * 1000.0).round() as i64)
}

fn ref_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

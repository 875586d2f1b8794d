use std::sync::Arc;

use actix_web::error::InternalError;
use actix_web::{HttpRequest, HttpResponse, Responder, delete, get, post, web};
use chrono::{Duration, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::app::runtime::IngestStats;
use crate::app::services::{
    ReservationLedger, ServiceError, SpotRegistry, SqliteParkingService, StatusReconciler,
};
use crate::domain::auth::AuthContext;
use crate::domain::clock::format_instant;
use crate::domain::models::{CarDetails, CarRecord, ReservationCandidate, ReservationRecord};
use crate::domain::reservation_rules::effective_status;

const USER_ID_HEADER: &str = "X-User-Id";
const USER_ROLE_HEADER: &str = "X-User-Role";
const USERNAME_HEADER: &str = "X-Username";

#[derive(Clone)]
pub struct ApiState {
    pub service: SqliteParkingService,
    pub booking_horizon_days: u32,
    pub ingest_stats: Option<Arc<IngestStats>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

#[derive(Debug, Deserialize)]
pub struct CarDetailsBody {
    pub license_plate: String,
    pub brand: String,
    pub model: String,
    pub color: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateReservationRequest {
    pub user_id: Option<String>,
    pub spot_number: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub car_details: Option<CarDetailsBody>,
}

#[derive(Debug, Deserialize)]
pub struct DateQuery {
    pub date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IntervalsQuery {
    pub date: String,
    pub spot: String,
}

#[derive(Debug, Deserialize)]
pub struct DisableRequest {
    pub spot_numbers: Vec<String>,
    pub disable: bool,
}

#[derive(Debug, Deserialize)]
pub struct BuzzerOffRequest {
    pub spot_number: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SpotStatusResponse {
    pub spot_number: String,
    pub status: &'static str,
    pub buzzer_active: bool,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SpotDetailsResponse {
    pub spot_number: String,
    pub status: &'static str,
    pub live_status: &'static str,
    pub is_disabled: bool,
    pub buzzer_active: bool,
    pub buzzer_muted: bool,
    pub username: Option<String>,
    pub time: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CarResponse {
    pub id: String,
    pub license_plate: String,
    pub brand: String,
    pub model: String,
    pub color: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ReservationResponse {
    pub id: String,
    pub user_id: String,
    pub username: Option<String>,
    pub spot_number: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub status: &'static str,
    pub car: Option<CarResponse>,
    pub created_at: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct BlockedIntervalResponse {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DiagnosticsDbResponse {
    pub schema_version: u32,
    pub spots_count: i64,
    pub reservations_count: i64,
    pub pending_commands: i64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DiagnosticsIngestResponse {
    pub applied: u64,
    pub unchanged: u64,
    pub unknown_topic: u64,
    pub invalid_payload: u64,
    pub unknown_spot: u64,
    pub storage_failures: u64,
    pub transport_failures: u64,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|error, _| {
        let response = error_response(
            HttpResponse::BadRequest(),
            "ValidationError",
            error.to_string(),
        );
        InternalError::from_response(error, response).into()
    }))
    .app_data(web::QueryConfig::default().error_handler(|error, _| {
        let response = error_response(
            HttpResponse::BadRequest(),
            "ValidationError",
            error.to_string(),
        );
        InternalError::from_response(error, response).into()
    }))
    .service(health)
    .service(create_reservation_endpoint)
    .service(spot_status_endpoint)
    .service(admin_spot_details_endpoint)
    .service(admin_disable_spots_endpoint)
    .service(buzzer_off_endpoint)
    .service(reserved_intervals_endpoint)
    .service(my_reservations_endpoint)
    .service(admin_reservations_endpoint)
    .service(admin_cancel_reservations_endpoint)
    .service(attach_car_endpoint)
    .service(delete_car_endpoint)
    .service(get_db_diagnostics_endpoint)
    .service(get_ingest_diagnostics_endpoint);
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[post("/api/reservations")]
async fn create_reservation_endpoint(
    req: HttpRequest,
    state: web::Data<ApiState>,
    body: web::Json<CreateReservationRequest>,
) -> HttpResponse {
    let context = match auth_context(&req) {
        Ok(context) => context,
        Err(response) => return response,
    };

    let user_id = match (context.user_id(), body.user_id.as_deref()) {
        (Some(own), None) => own.to_string(),
        (Some(own), Some(requested)) if own == requested => own.to_string(),
        (Some(_), Some(_)) => {
            return forbidden("users can only book for themselves");
        }
        (None, Some(requested)) if !requested.trim().is_empty() => requested.trim().to_string(),
        (None, _) => return bad_request("user_id is required when booking as admin"),
    };

    let date = match parse_date(&body.date) {
        Ok(date) => date,
        Err(response) => return response,
    };
    let today = state.service.today();
    let last_bookable = today + Duration::days(i64::from(state.booking_horizon_days));
    if date < today || date > last_bookable {
        return bad_request(format!(
            "date must be between {today} and {last_bookable}"
        ));
    }

    let (start, end) = match (parse_time(&body.start_time), parse_time(&body.end_time)) {
        (Ok(start), Ok(end)) => (start, end),
        (Err(response), _) | (_, Err(response)) => return response,
    };

    let car = match body.car_details.as_ref().map(car_details).transpose() {
        Ok(car) => car,
        Err(response) => return response,
    };

    let calendar = state.service.calendar();
    let candidate = ReservationCandidate {
        user_id,
        spot_number: body.spot_number.trim().to_string(),
        start_time: calendar.instant_at(date, start),
        end_time: calendar.instant_at(date, end),
    };

    match state.service.create_as(&candidate, car.as_ref(), &context) {
        Ok(reservation) => {
            HttpResponse::Created().json(serde_json::json!({ "id": reservation.id }))
        }
        Err(error) => service_error_response(error),
    }
}

#[get("/api/spots/status")]
async fn spot_status_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<DateQuery>,
) -> HttpResponse {
    let date = match optional_date(&state, query.date.as_deref()) {
        Ok(date) => date,
        Err(response) => return response,
    };

    match state.service.resolve_date(date) {
        Ok(views) => HttpResponse::Ok().json(
            views
                .into_iter()
                .map(|view| SpotStatusResponse {
                    spot_number: view.spot.spot_number,
                    status: view.status.as_str(),
                    buzzer_active: view.spot.buzzer_active,
                })
                .collect::<Vec<_>>(),
        ),
        Err(error) => service_error_response(error),
    }
}

#[get("/api/admin/spots/details")]
async fn admin_spot_details_endpoint(
    req: HttpRequest,
    state: web::Data<ApiState>,
    query: web::Query<DateQuery>,
) -> HttpResponse {
    if let Err(response) = require_admin(&req) {
        return response;
    }
    let date = match optional_date(&state, query.date.as_deref()) {
        Ok(date) => date,
        Err(response) => return response,
    };

    let calendar = state.service.calendar();
    match state.service.resolve_date(date) {
        Ok(views) => HttpResponse::Ok().json(
            views
                .into_iter()
                .map(|view| {
                    let (username, time) = match &view.reserving {
                        Some(reservation) => (
                            Some(reservation.display_name().to_string()),
                            Some(format!(
                                "{} - {}",
                                calendar.local_time_label(reservation.start_time),
                                calendar.local_time_label(reservation.end_time)
                            )),
                        ),
                        None => (None, None),
                    };

                    SpotDetailsResponse {
                        status: view.status.as_str(),
                        live_status: view.spot.live_status.as_str(),
                        is_disabled: view.spot.is_disabled,
                        buzzer_active: view.spot.buzzer_active,
                        buzzer_muted: view.spot.buzzer_muted,
                        spot_number: view.spot.spot_number,
                        username,
                        time,
                    }
                })
                .collect::<Vec<_>>(),
        ),
        Err(error) => service_error_response(error),
    }
}

#[post("/api/admin/spots/disable")]
async fn admin_disable_spots_endpoint(
    req: HttpRequest,
    state: web::Data<ApiState>,
    body: web::Json<DisableRequest>,
) -> HttpResponse {
    if let Err(response) = require_admin(&req) {
        return response;
    }
    if body.spot_numbers.is_empty() {
        return bad_request("spot_numbers must not be empty");
    }

    for spot_number in &body.spot_numbers {
        if let Err(error) = state.service.get_spot(spot_number) {
            return service_error_response(error);
        }
    }

    let mut updated = Vec::with_capacity(body.spot_numbers.len());
    for spot_number in &body.spot_numbers {
        match state.service.set_disabled(spot_number, body.disable) {
            Ok(spot) => updated.push(serde_json::json!({
                "spot_number": spot.spot_number,
                "is_disabled": spot.is_disabled,
                "live_status": spot.live_status.as_str(),
            })),
            Err(error) => return service_error_response(error),
        }
    }

    HttpResponse::Ok().json(serde_json::json!({ "updated": updated }))
}

#[post("/api/buzzer/off")]
async fn buzzer_off_endpoint(
    req: HttpRequest,
    state: web::Data<ApiState>,
    body: web::Json<BuzzerOffRequest>,
) -> HttpResponse {
    let context = match auth_context(&req) {
        Ok(context) => context,
        Err(response) => return response,
    };

    match state.service.mute_buzzer(body.spot_number.trim(), &context) {
        Ok(spot) => HttpResponse::Ok().json(serde_json::json!({
            "spot_number": spot.spot_number,
            "buzzer_active": spot.buzzer_active,
            "buzzer_muted": spot.buzzer_muted,
        })),
        Err(error) => service_error_response(error),
    }
}

#[get("/api/reserved-intervals")]
async fn reserved_intervals_endpoint(
    state: web::Data<ApiState>,
    query: web::Query<IntervalsQuery>,
) -> HttpResponse {
    let date = match parse_date(&query.date) {
        Ok(date) => date,
        Err(response) => return response,
    };

    match state.service.reserved_intervals(query.spot.trim(), date) {
        Ok(intervals) => HttpResponse::Ok().json(serde_json::json!({
            "blocked_intervals": intervals
                .into_iter()
                .map(|interval| BlockedIntervalResponse {
                    start: interval.start,
                    end: interval.end,
                })
                .collect::<Vec<_>>()
        })),
        Err(error) => service_error_response(error),
    }
}

#[get("/api/reservations/mine")]
async fn my_reservations_endpoint(req: HttpRequest, state: web::Data<ApiState>) -> HttpResponse {
    let context = match auth_context(&req) {
        Ok(context) => context,
        Err(response) => return response,
    };
    let Some(user_id) = context.user_id() else {
        return forbidden("a user identity is required");
    };

    match state.service.list_upcoming(&AuthContext::user(user_id)) {
        Ok(reservations) => HttpResponse::Ok().json(reservation_responses(&state, reservations)),
        Err(error) => service_error_response(error),
    }
}

#[get("/api/admin/reservations")]
async fn admin_reservations_endpoint(
    req: HttpRequest,
    state: web::Data<ApiState>,
) -> HttpResponse {
    let context = match require_admin(&req) {
        Ok(context) => context,
        Err(response) => return response,
    };

    match state.service.list_upcoming(&context) {
        Ok(reservations) => HttpResponse::Ok().json(reservation_responses(&state, reservations)),
        Err(error) => service_error_response(error),
    }
}

#[post("/api/admin/reservations/cancel")]
async fn admin_cancel_reservations_endpoint(
    req: HttpRequest,
    state: web::Data<ApiState>,
    body: web::Json<CancelRequest>,
) -> HttpResponse {
    let context = match auth_context(&req) {
        Ok(context) => context,
        Err(response) => return response,
    };

    match state.service.cancel(&body.ids, &context) {
        Ok(updated) => HttpResponse::Ok().json(serde_json::json!({ "updated": updated })),
        Err(error) => service_error_response(error),
    }
}

#[post("/api/reservations/{id}/car")]
async fn attach_car_endpoint(
    req: HttpRequest,
    state: web::Data<ApiState>,
    path: web::Path<String>,
    body: web::Json<CarDetailsBody>,
) -> HttpResponse {
    let context = match auth_context(&req) {
        Ok(context) => context,
        Err(response) => return response,
    };
    let car = match car_details(&body) {
        Ok(car) => car,
        Err(response) => return response,
    };

    match state.service.attach_car(&path, &car, &context) {
        Ok(reservation) => HttpResponse::Ok().json(reservation_response(&state, reservation)),
        Err(error) => service_error_response(error),
    }
}

#[delete("/api/cars/{id}")]
async fn delete_car_endpoint(
    req: HttpRequest,
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> HttpResponse {
    let context = match auth_context(&req) {
        Ok(context) => context,
        Err(response) => return response,
    };

    match state.service.delete_car(&path, &context) {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(error) => service_error_response(error),
    }
}

#[get("/diagnostics/db")]
async fn get_db_diagnostics_endpoint(state: web::Data<ApiState>) -> HttpResponse {
    match state.service.diagnostics() {
        Ok(snapshot) => HttpResponse::Ok().json(DiagnosticsDbResponse {
            schema_version: snapshot.schema_version,
            spots_count: snapshot.spots_count,
            reservations_count: snapshot.reservations_count,
            pending_commands: snapshot.pending_commands,
        }),
        Err(error) => service_error_response(error),
    }
}

#[get("/diagnostics/ingest")]
async fn get_ingest_diagnostics_endpoint(state: web::Data<ApiState>) -> HttpResponse {
    let Some(stats) = &state.ingest_stats else {
        return error_response(
            HttpResponse::NotFound(),
            "NotFound",
            "sensor ingestion does not run in this process",
        );
    };

    let snapshot = stats.snapshot();
    HttpResponse::Ok().json(DiagnosticsIngestResponse {
        applied: snapshot.applied,
        unchanged: snapshot.unchanged,
        unknown_topic: snapshot.unknown_topic,
        invalid_payload: snapshot.invalid_payload,
        unknown_spot: snapshot.unknown_spot,
        storage_failures: snapshot.storage_failures,
        transport_failures: snapshot.transport_failures,
    })
}

/// Reads the identity headers set by the session provider in front of us.
fn auth_context(req: &HttpRequest) -> Result<AuthContext, HttpResponse> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    let user_id = header(USER_ID_HEADER);
    let role = header(USER_ROLE_HEADER);
    let username = header(USERNAME_HEADER);

    let context = match (role.as_deref(), user_id) {
        (Some("admin"), _) => AuthContext::admin(),
        (Some("user") | None, Some(user_id)) => AuthContext::user(user_id),
        (None, None) => {
            return Err(error_response(
                HttpResponse::Unauthorized(),
                "Unauthenticated",
                "identity headers are missing",
            ));
        }
        (Some("user"), None) => return Err(bad_request("X-User-Id is required for users")),
        (Some(other), _) => return Err(bad_request(format!("unknown role: {other}"))),
    };

    Ok(match username {
        Some(username) => context.with_username(username),
        None => context,
    })
}

fn require_admin(req: &HttpRequest) -> Result<AuthContext, HttpResponse> {
    let context = auth_context(req)?;
    if !context.is_admin() {
        return Err(forbidden("admin role required"));
    }
    Ok(context)
}

fn optional_date(state: &ApiState, raw: Option<&str>) -> Result<NaiveDate, HttpResponse> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        Some(raw) => parse_date(raw),
        None => Ok(state.service.today()),
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, HttpResponse> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| bad_request(format!("date must be YYYY-MM-DD, got {raw:?}")))
}

fn parse_time(raw: &str) -> Result<NaiveTime, HttpResponse> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|_| bad_request(format!("time must be HH:MM, got {raw:?}")))
}

fn car_details(body: &CarDetailsBody) -> Result<CarDetails, HttpResponse> {
    let fields = [
        ("license_plate", &body.license_plate),
        ("brand", &body.brand),
        ("model", &body.model),
        ("color", &body.color),
    ];
    if let Some((name, _)) = fields.iter().find(|(_, value)| value.trim().is_empty()) {
        return Err(bad_request(format!("car_details.{name} must not be empty")));
    }

    Ok(CarDetails {
        license_plate: body.license_plate.trim().to_uppercase(),
        brand: body.brand.trim().to_string(),
        model: body.model.trim().to_string(),
        color: body.color.trim().to_string(),
    })
}

fn reservation_responses(
    state: &ApiState,
    reservations: Vec<ReservationRecord>,
) -> Vec<ReservationResponse> {
    reservations
        .into_iter()
        .map(|reservation| reservation_response(state, reservation))
        .collect()
}

fn reservation_response(state: &ApiState, reservation: ReservationRecord) -> ReservationResponse {
    let calendar = state.service.calendar();
    let status = effective_status(reservation.status, reservation.end_time, state.service.now());

    ReservationResponse {
        date: calendar.date_of(reservation.start_time).to_string(),
        start_time: calendar.local_time_label(reservation.start_time),
        end_time: calendar.local_time_label(reservation.end_time),
        status: status.as_str(),
        car: reservation.car.map(car_response),
        created_at: format_instant(reservation.created_at),
        id: reservation.id,
        user_id: reservation.user_id,
        username: reservation.username,
        spot_number: reservation.spot_number,
    }
}

fn car_response(car: CarRecord) -> CarResponse {
    CarResponse {
        id: car.id,
        license_plate: car.license_plate,
        brand: car.brand,
        model: car.model,
        color: car.color,
    }
}

fn error_response(
    mut builder: actix_web::HttpResponseBuilder,
    code: &str,
    message: impl Into<String>,
) -> HttpResponse {
    builder.json(ErrorBody {
        error: code.to_string(),
        message: message.into(),
    })
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    error_response(HttpResponse::BadRequest(), "ValidationError", message)
}

fn forbidden(message: impl Into<String>) -> HttpResponse {
    error_response(HttpResponse::Forbidden(), "Forbidden", message)
}

fn service_error_response(error: ServiceError) -> HttpResponse {
    match error {
        ServiceError::DbLockPoisoned | ServiceError::Database(_) => {
            tracing::error!(error = %error, "request failed on storage");
            error_response(
                HttpResponse::InternalServerError(),
                "Internal",
                error.to_string(),
            )
        }
        ServiceError::NotFound { .. } => {
            error_response(HttpResponse::NotFound(), "NotFound", error.to_string())
        }
        ServiceError::Unauthorized(message) => forbidden(message),
        ServiceError::Conflict(reason) => {
            error_response(HttpResponse::Conflict(), reason.code(), reason.to_string())
        }
    }
}

use log::warn;
use std::collections::BTreeMap;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::config::RawConfig;
use crate::controller::GpioController;
use crate::error::AppError;
use crate::gpio::GpioBackend;
use crate::notify::{BroadcastNotifier, StateUpdate};
use crate::roster::{InputSettings, PIN_COUNT, PinChoice};
use crate::state::{FEEDBACK_HIGH_COLOR, FEEDBACK_LOW_COLOR, Level, PinState};

pub struct AppState<B: GpioBackend> {
    pub controller: Arc<GpioController<B>>,
    pub notifier: Arc<BroadcastNotifier>,
}

impl<B: GpioBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
            notifier: Arc::clone(&self.notifier),
        }
    }
}

#[derive(Serialize)]
struct RosterView {
    outputs: Vec<u8>,
    inputs: BTreeMap<u8, InputSettings>,
    all_active: Vec<u8>,
    triggered_inputs: Vec<u8>,
    output_choices: Vec<PinChoice>,
    active_choices: Vec<PinChoice>,
}

#[derive(Serialize)]
struct PinStateView {
    pin: u8,
    state: PinState,
}

#[derive(Deserialize, Default)]
struct FeedbackQuery {
    bg_high: Option<u32>,
    bg_low: Option<u32>,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<StateUpdate>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            update = events.next() => {
                let Some(update) = update else { break; };

                match update {
                    Ok(update) => {
                        if let Ok(text) = serde_json::to_string(&update) {
                            if session.text(text).await.is_err() {
                                warn!("WebSocket client disconnected");
                                break;
                            }
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let notice = AppError::Gpio(format!("State stream lagged by {n} updates"));
                        if session.text(notice.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl<B: GpioBackend + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/pins")
                    .route(web::get().to(list_pins::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/states")
                    .route(web::get().to(list_states::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/variables")
                    .route(web::get().to(list_variables::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/status")
                    .route(web::get().to(get_status::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/config")
                    .route(web::get().to(get_config::<B>))
                    .route(web::post().to(set_config::<B>))
                    .route(not_allowed(&[Method::GET, Method::POST])),
            )
            .service(
                web::resource("/events")
                    .route(web::get().to(events_ws::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpio/{pin_id}")
                    .route(web::get().to(get_pin::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
            .service(
                web::resource("/gpio/{pin_id}/value")
                    .route(web::get().to(get_pin::<B>))
                    .route(web::post().to(set_value::<B>))
                    .route(not_allowed(&[Method::GET, Method::POST])),
            )
            .service(
                web::resource("/gpio/{pin_id}/high")
                    .route(web::post().to(set_high::<B>))
                    .route(not_allowed(&[Method::POST])),
            )
            .service(
                web::resource("/gpio/{pin_id}/low")
                    .route(web::post().to(set_low::<B>))
                    .route(not_allowed(&[Method::POST])),
            )
            .service(
                web::resource("/gpio/{pin_id}/feedback")
                    .route(web::get().to(get_feedback::<B>))
                    .route(not_allowed(&[Method::GET])),
            )
    }
}

async fn list_pins<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let roster = state.controller.roster();

    Ok(web::Json(RosterView {
        outputs: roster.outputs().to_vec(),
        inputs: roster.inputs().clone(),
        all_active: roster.all_active(),
        triggered_inputs: roster.triggered_inputs(),
        output_choices: roster.output_choices(),
        active_choices: roster.active_choices(),
    }))
}

async fn list_states<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.controller.states()))
}

async fn list_variables<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.controller.variables()))
}

async fn get_status<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.controller.status()))
}

async fn get_config<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    Ok(web::Json(state.controller.config()))
}

async fn set_config<B: GpioBackend + 'static>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty config payload".into()));
    }
    let raw: RawConfig = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid config payload: {e}")))?;

    let status = state.controller.reconfigure(&raw).await?;

    Ok(web::Json(status))
}

async fn get_pin<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let pin = parse_pin_id(&req)?;
    let pin_state = state.controller.state(pin)?;

    Ok(web::Json(PinStateView {
        pin,
        state: pin_state,
    }))
}

async fn get_feedback<B: GpioBackend + 'static>(
    req: HttpRequest,
    query: web::Query<FeedbackQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let pin = parse_pin_id(&req)?;
    let pin_state = state.controller.state(pin)?;

    let color = pin_state.feedback(
        query.bg_high.unwrap_or(FEEDBACK_HIGH_COLOR),
        query.bg_low.unwrap_or(FEEDBACK_LOW_COLOR),
    );

    Ok(match color {
        Some(bgcolor) => web::Json(json!({ "bgcolor": bgcolor })),
        None => web::Json(json!({})),
    })
}

async fn set_value<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let pin = parse_pin_id(&req)?;
    let level = parse_value_payload(&body)?;

    let outcome = state.controller.set_pin(pin, level).await?;

    Ok(web::Json(outcome))
}

async fn set_high<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let pin = parse_pin_id(&req)?;
    let outcome = state.controller.set_pin(pin, Level::High).await?;

    Ok(web::Json(outcome))
}

async fn set_low<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let pin = parse_pin_id(&req)?;
    let outcome = state.controller.set_pin(pin, Level::Low).await?;

    Ok(web::Json(outcome))
}

async fn events_ws<B: GpioBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, AppError> {
    let rx = state.notifier.subscribe();
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::Gpio(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx).await;
    });

    Ok(response)
}

fn parse_value_payload(body: &[u8]) -> Result<Level, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty value payload".into()));
    }

    match std::str::from_utf8(body) {
        Ok(text) => match text.trim() {
            "1" | "HIGH" | "high" => Ok(Level::High),
            "0" | "LOW" | "low" => Ok(Level::Low),
            _ => Err(AppError::InvalidValue(
                "Value must be 0, 1, HIGH or LOW".into(),
            )),
        },
        _ => Err(AppError::InvalidValue(
            "Value payload must be valid UTF-8".into(),
        )),
    }
}

fn parse_pin_id(req: &HttpRequest) -> Result<u8, AppError> {
    let pin_id = req
        .match_info()
        .get("pin_id")
        .ok_or_else(|| AppError::InvalidValue("Missing pin id".into()))?;
    let pin = pin_id
        .parse::<u8>()
        .map_err(|_| AppError::InvalidValue("Invalid pin id".into()))?;
    if pin >= PIN_COUNT {
        return Err(AppError::NotFoundPin(pin_id.to_string()));
    }

    Ok(pin)
}

fn not_allowed(methods: &[Method]) -> actix_web::Route {
    web::route()
        .guard(guard_not_methods(methods))
        .to(method_not_allowed)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}

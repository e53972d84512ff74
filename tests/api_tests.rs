use std::collections::BTreeMap;
use std::sync::Arc;

use actix_web::{App, http::StatusCode, test, web};
use pinsync::{AppState, BroadcastNotifier, FixedBaseOffset, GpioController, MockGpioBackend};
use serde_json::{Value, json};
use tokio::sync::mpsc;

fn sample_config() -> Value {
    json!({
        "refresh_interval_ms": 60000,
        "base_offset": 0,
        "use_gpio_17": true,
        "gpio_in_out_17": "out",
        "use_gpio_22": true,
        "gpio_in_out_22": "out",
        "use_gpio_27": true,
        "gpio_in_out_27": "in",
        "gpio_trigger_type_27": "both",
    })
}

async fn app_state(backend: &MockGpioBackend, config: Value) -> AppState<MockGpioBackend> {
    let notifier = Arc::new(BroadcastNotifier::new(16));
    let (faults, _) = mpsc::unbounded_channel();
    let controller = Arc::new(GpioController::new(
        Arc::new(backend.clone()),
        Arc::new(FixedBaseOffset(0)),
        notifier.clone(),
        faults,
    ));
    let raw = serde_json::from_value(config).expect("valid sample config");
    let _ = controller.init(&raw).await;

    AppState {
        controller,
        notifier,
    }
}

macro_rules! init_app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .service($state.api_scope("/api/v1")),
        )
        .await
    };
}

#[actix_rt::test]
async fn list_pins_returns_roster() {
    let backend = MockGpioBackend::default();
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::get().uri("/api/v1/pins").to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(response["outputs"], json!([17, 22]));
    assert_eq!(response["all_active"], json!([17, 22, 27]));
    assert_eq!(response["triggered_inputs"], json!([27]));
    assert_eq!(response["inputs"]["27"]["trigger"], "both");
    assert_eq!(response["output_choices"][0], json!({ "id": 17, "label": "17" }));
    assert_eq!(response["active_choices"].as_array().unwrap().len(), 3);
}

#[actix_rt::test]
async fn set_high_then_read_states() {
    let backend = MockGpioBackend::default();
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/17/high")
        .to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response, json!({ "result": "written", "state": "HIGH" }));
    assert_eq!(backend.level(17), Some(1));

    let req = test::TestRequest::get().uri("/api/v1/states").to_request();
    let states: BTreeMap<String, Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(states["17"], "HIGH");
    assert_eq!(states.len(), 3);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/17/value")
        .to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response, json!({ "pin": 17, "state": "HIGH" }));
}

#[actix_rt::test]
async fn set_value_accepts_words_and_digits() {
    let backend = MockGpioBackend::default();
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/22/value")
        .set_payload("1")
        .to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response["state"], "HIGH");

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/22/value")
        .set_payload("LOW")
        .to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response["state"], "LOW");
    assert_eq!(backend.level(22), Some(0));

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/22/low")
        .to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[actix_rt::test]
async fn invalid_value_is_bad_request() {
    let backend = MockGpioBackend::default();
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/17/value")
        .set_payload("on")
        .to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/17/value")
        .to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[actix_rt::test]
async fn writing_an_input_is_skipped() {
    let backend = MockGpioBackend::default();
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/27/high")
        .to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response, json!({ "result": "skipped" }));
}

#[actix_rt::test]
async fn unknown_pins_are_rejected() {
    let backend = MockGpioBackend::default();
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::get().uri("/api/v1/gpio/99").to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // valid pin but not configured
    let req = test::TestRequest::get().uri("/api/v1/gpio/5").to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains('5'));

    let req = test::TestRequest::get().uri("/api/v1/gpio/abc").to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[actix_rt::test]
async fn wrong_method_is_not_allowed() {
    let backend = MockGpioBackend::default();
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/17/high")
        .to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let req = test::TestRequest::delete().uri("/api/v1/pins").to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[actix_rt::test]
async fn variables_follow_pin_states() {
    let backend = MockGpioBackend::default();
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/22/high")
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::get().uri("/api/v1/variables").to_request();
    let vars: BTreeMap<String, String> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(vars["base"], "0");
    assert_eq!(vars["gpio_state_22"], "HIGH");
    assert_eq!(vars["gpio_state_17"], "LOW");
    assert!(!vars.contains_key("gpio_state_5"));
}

#[actix_rt::test]
async fn feedback_uses_default_and_custom_colors() {
    let backend = MockGpioBackend::default();
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/17/high")
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/17/feedback")
        .to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response, json!({ "bgcolor": 0x00FF00 }));

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/17/low")
        .to_request();
    test::call_service(&app, req).await;

    let req = test::TestRequest::get()
        .uri("/api/v1/gpio/17/feedback?bg_low=255")
        .to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response, json!({ "bgcolor": 255 }));
}

#[actix_rt::test]
async fn status_reports_degraded_pins() {
    let backend = MockGpioBackend::default();
    backend.fail_open(22, "Device or resource busy");
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::get().uri("/api/v1/status").to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response["state"], "degraded");
    assert_eq!(response["failed_pins"][0]["pin"], 22);
    assert!(
        response["failed_pins"][0]["reason"]
            .as_str()
            .unwrap()
            .contains("Device or resource busy")
    );
}

#[actix_rt::test]
async fn post_config_rebuilds_pins() {
    let backend = MockGpioBackend::default();
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/config")
        .set_json(json!({ "use_gpio_4": true, "gpio_in_out_4": "out" }))
        .to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response["state"], "ok");

    assert!(!backend.is_open(17));
    assert!(backend.is_open(4));

    let req = test::TestRequest::get().uri("/api/v1/pins").to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response["outputs"], json!([4]));

    let req = test::TestRequest::get().uri("/api/v1/config").to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response["use_gpio_4"], true);
}

#[actix_rt::test]
async fn post_invalid_config_is_bad_request() {
    let backend = MockGpioBackend::default();
    let state = app_state(&backend, sample_config()).await;
    let app = init_app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/config")
        .set_json(json!({ "use_gpio_4": true, "gpio_in_out_4": "sideways" }))
        .to_request();
    let response = test::call_service(&app, req).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::get().uri("/api/v1/status").to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response["state"], "ok");
    assert!(backend.is_open(17));
    assert!(!backend.is_open(4));

    let req = test::TestRequest::post()
        .uri("/api/v1/gpio/17/high")
        .to_request();
    let response: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(response["state"], "HIGH");
}

//! Shelly Pro 3EM (Gen2) emulation: HTTP RPC endpoints, JSON-RPC over HTTP
//! POST and WebSocket, and mDNS advertisement.
//!
//! Field names and rounding follow what the real device reports, since client
//! firmware parses these responses strictly.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_derive::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ShellyConfig;
use crate::discovery::{Advertisement, Advertiser};
use crate::error::ConfigError;
use crate::identity::{DeviceIdentity, MacAddress};
use crate::meter_data::{MeterSnapshot, PhaseCount, PhaseReading};
use crate::snapshot_store::SnapshotStore;

pub const SHELLY_NAME: &str = "Shelly Pro 3EM Emulator";
pub const SHELLY_MODEL: &str = "SPEM-003CEBEU";
pub const SHELLY_GEN: u8 = 2;
pub const SHELLY_APP: &str = "Pro3EM";
pub const SHELLY_FW_VER: &str = "1.4.4-g6d2a586";
pub const SHELLY_FW_ID: &str = "20241011-114455/1.4.4-g6d2a586";

/// Real Gen2 devices announce both the generic and the vendor service type.
pub const SERVICE_TYPES: &[&str] = &["_http._tcp.local.", "_shelly._tcp.local."];

/// Reported in `errors` while there is no fresh reading to serve.
const METER_FAILURE: &str = "power_meter_failure";

const PHASE_KEYS: [char; 3] = ['a', 'b', 'c'];

pub fn identity(mac: MacAddress, phases: PhaseCount) -> DeviceIdentity {
    DeviceIdentity {
        device_id: format!("shellypro3em-{}", mac.to_lowercase()),
        mac,
        name: SHELLY_NAME.to_string(),
        model: SHELLY_MODEL.to_string(),
        gen: SHELLY_GEN,
        fw_id: SHELLY_FW_ID.to_string(),
        version: SHELLY_FW_VER.to_string(),
        app: SHELLY_APP.to_string(),
        profile: match phases {
            PhaseCount::Single => "monophase",
            PhaseCount::Three => "triphase",
        }
        .to_string(),
    }
}

pub fn advertisement(identity: &DeviceIdentity, port: u16) -> Advertisement {
    Advertisement {
        instance_name: identity.device_id.clone(),
        host_name: format!("{}.local.", identity.device_id),
        port,
        service_types: SERVICE_TYPES.iter().map(|s| s.to_string()).collect(),
        properties: HashMap::from([
            ("id".to_string(), identity.device_id.clone()),
            ("mac".to_string(), identity.mac.to_string()),
            ("arch".to_string(), "esp32".to_string()),
            ("gen".to_string(), identity.gen.to_string()),
            ("app".to_string(), identity.app.clone()),
            ("ver".to_string(), identity.version.clone()),
        ]),
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn kwh_to_wh(kwh: f64) -> f64 {
    kwh * 1000.0
}

fn errors(snapshot: Option<&MeterSnapshot>, online: bool) -> Value {
    if snapshot.is_some() && online {
        json!([])
    } else {
        json!([METER_FAILURE])
    }
}

pub fn device_info(identity: &DeviceIdentity) -> Value {
    json!({
        "name": identity.name,
        "id": identity.device_id,
        "mac": identity.mac.to_string(),
        "slot": 0,
        "model": identity.model,
        "gen": identity.gen,
        "fw_id": identity.fw_id,
        "ver": identity.version,
        "app": identity.app,
        "profile": identity.profile,
        "auth_en": false,
        "auth_domain": null,
    })
}

fn phase_fields(result: &mut Map<String, Value>, key: char, phase: Option<&PhaseReading>) {
    let field = |value: fn(&PhaseReading) -> f64, decimals: i32| {
        phase.map_or(Value::Null, |p| json!(round_to(value(p), decimals)))
    };
    result.insert(format!("{key}_current"), field(|p| p.current, 3));
    result.insert(format!("{key}_voltage"), field(|p| p.voltage, 1));
    result.insert(format!("{key}_act_power"), field(|p| p.act_power, 1));
    result.insert(format!("{key}_aprt_power"), field(|p| p.aprt_power, 1));
    result.insert(format!("{key}_pf"), field(|p| p.power_factor, 2));
    result.insert(format!("{key}_freq"), field(|p| p.frequency, 1));
}

/// `EM.GetStatus`: instantaneous readings for every configured phase.
///
/// Before the first successful poll every reading is `null`; zeros would be
/// indistinguishable from an idle grid.
pub fn em_status(snapshot: Option<&MeterSnapshot>, online: bool, phases: PhaseCount) -> Value {
    let mut result = Map::new();
    result.insert("id".to_string(), json!(0));
    for (index, key) in PHASE_KEYS.iter().take(phases.count()).enumerate() {
        phase_fields(&mut result, *key, snapshot.and_then(|s| s.phase(index)));
    }
    let total = |value: fn(&MeterSnapshot) -> f64, decimals: i32| {
        snapshot.map_or(Value::Null, |s| json!(round_to(value(s), decimals)))
    };
    result.insert("n_current".to_string(), Value::Null);
    result.insert("total_current".to_string(), total(|s| s.total_current(), 3));
    result.insert("total_act_power".to_string(), total(|s| s.total_act_power(), 1));
    result.insert("total_aprt_power".to_string(), total(|s| s.total_aprt_power(), 1));
    result.insert("user_calibrated_phase".to_string(), json!([]));
    result.insert("errors".to_string(), errors(snapshot, online));
    Value::Object(result)
}

/// `EMData.GetStatus`: cumulative energy in Wh, as the device reports it.
pub fn emdata_status(snapshot: Option<&MeterSnapshot>, phases: PhaseCount) -> Value {
    let mut result = Map::new();
    result.insert("id".to_string(), json!(0));
    let energy = |kwh: f64| json!(round_to(kwh_to_wh(kwh), 2));
    for (index, key) in PHASE_KEYS.iter().take(phases.count()).enumerate() {
        let phase = snapshot.and_then(|s| s.phase(index));
        result.insert(
            format!("{key}_total_act_energy"),
            phase.map_or(Value::Null, |p| energy(p.energy_imported_kwh)),
        );
        result.insert(
            format!("{key}_total_act_ret_energy"),
            phase.map_or(Value::Null, |p| energy(p.energy_exported_kwh)),
        );
    }
    result.insert(
        "total_act".to_string(),
        snapshot.map_or(Value::Null, |s| energy(s.energy_imported_kwh())),
    );
    result.insert(
        "total_act_ret".to_string(),
        snapshot.map_or(Value::Null, |s| energy(s.energy_exported_kwh())),
    );
    Value::Object(result)
}

/// `EM1.GetStatus`: one phase viewed as its own meter channel.
pub fn em1_status(snapshot: Option<&MeterSnapshot>, online: bool, id: usize) -> Value {
    let phase = snapshot.and_then(|s| s.phase(id));
    let field = |value: fn(&PhaseReading) -> f64, decimals: i32| {
        phase.map_or(Value::Null, |p| json!(round_to(value(p), decimals)))
    };
    json!({
        "id": id,
        "current": field(|p| p.current, 3),
        "voltage": field(|p| p.voltage, 1),
        "act_power": field(|p| p.act_power, 1),
        "aprt_power": field(|p| p.aprt_power, 1),
        "pf": field(|p| p.power_factor, 2),
        "freq": field(|p| p.frequency, 1),
        "calibration": "factory",
        "errors": errors(snapshot, online),
    })
}

pub fn em1data_status(snapshot: Option<&MeterSnapshot>, id: usize) -> Value {
    let phase = snapshot.and_then(|s| s.phase(id));
    let energy = |value: fn(&PhaseReading) -> f64| {
        phase.map_or(Value::Null, |p| json!(round_to(kwh_to_wh(value(p)), 2)))
    };
    json!({
        "id": id,
        "total_act_energy": energy(|p| p.energy_imported_kwh),
        "total_act_ret_energy": energy(|p| p.energy_exported_kwh),
    })
}

pub fn shelly_config(identity: &DeviceIdentity) -> Value {
    json!({
        "em:0": {
            "id": 0,
            "name": null,
            "blink_mode_selector": "active_energy",
            "ct_type": "120A",
            "monitor_phase_sequence": false,
            "phase_selector": "all",
            "reverse": {},
        },
        "emdata:0": {},
        "sys": {
            "device": {
                "mac": identity.mac.to_string(),
                "name": identity.name,
                "fw_id": identity.fw_id,
                "profile": identity.profile,
                "discoverable": true,
                "eco_mode": false,
                "addon_type": null,
            },
        },
    })
}

/// Shelly Gen2 RPC error, rendered as `{code, message}`.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn not_found(argument: &str, value: &Value) -> Self {
        Self {
            code: -105,
            message: format!("Argument '{argument}', value {value} not found!"),
        }
    }

    pub fn invalid_argument(argument: &str) -> Self {
        Self {
            code: -103,
            message: format!("Invalid argument '{argument}'!"),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -114,
            message: format!("Method {method} failed: Method not found!"),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.code {
            -103 => StatusCode::BAD_REQUEST,
            _ => StatusCode::NOT_FOUND,
        }
    }

    fn to_json(&self) -> Value {
        json!({ "code": self.code, "message": self.message })
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.to_json())).into_response()
    }
}

#[derive(Clone)]
pub struct ShellyState {
    identity: Arc<DeviceIdentity>,
    store: SnapshotStore,
    started: Instant,
}

impl ShellyState {
    pub fn new(identity: DeviceIdentity, store: SnapshotStore) -> Self {
        Self {
            identity: Arc::new(identity),
            store,
            started: Instant::now(),
        }
    }

    fn phases(&self) -> PhaseCount {
        self.store.phases()
    }

    /// Reads `params.id`, defaulting to 0, and checks it against `limit`.
    fn component_id(params: &Value, limit: usize) -> Result<usize, RpcError> {
        let id = match params.get("id") {
            None | Some(Value::Null) => return Ok(0),
            Some(id) => id,
        };
        let index = id.as_u64().ok_or_else(|| RpcError::invalid_argument("id"))?;
        match usize::try_from(index) {
            Ok(index) if index < limit => Ok(index),
            _ => Err(RpcError::not_found("id", id)),
        }
    }

    fn shelly_status(&self) -> Value {
        let (snapshot, online) = self.store.read();
        let now = Utc::now();
        json!({
            "sys": {
                "mac": self.identity.mac.to_string(),
                "restart_required": false,
                "time": now.format("%H:%M").to_string(),
                "unixtime": now.timestamp(),
                "uptime": self.started.elapsed().as_secs(),
                "available_updates": {},
            },
            "em:0": em_status(snapshot.as_deref(), online, self.phases()),
            "emdata:0": emdata_status(snapshot.as_deref(), self.phases()),
        })
    }

    /// Resolves one RPC method against the latest snapshot.
    pub fn dispatch(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let (snapshot, online) = self.store.read();
        let phases = self.phases();
        match method {
            "Shelly.GetDeviceInfo" => Ok(device_info(&self.identity)),
            "Shelly.GetStatus" => Ok(self.shelly_status()),
            "Shelly.GetConfig" => Ok(shelly_config(&self.identity)),
            "Shelly.GetComponents" => Ok(json!({
                "components": [],
                "cfg_rev": 0,
                "offset": 0,
                "total": 0,
            })),
            "EM.GetStatus" => {
                Self::component_id(params, 1)?;
                Ok(em_status(snapshot.as_deref(), online, phases))
            }
            "EMData.GetStatus" => {
                Self::component_id(params, 1)?;
                Ok(emdata_status(snapshot.as_deref(), phases))
            }
            "EM1.GetStatus" => {
                let id = Self::component_id(params, phases.count())?;
                Ok(em1_status(snapshot.as_deref(), online, id))
            }
            "EM1Data.GetStatus" => {
                let id = Self::component_id(params, phases.count())?;
                Ok(em1data_status(snapshot.as_deref(), id))
            }
            _ => Err(RpcError::method_not_found(method)),
        }
    }

    /// Wraps a dispatch result in the Gen2 JSON-RPC frame.
    fn envelope(&self, request: RpcRequest) -> Value {
        let mut response = json!({
            "id": request.id,
            "src": self.identity.device_id,
            "dst": request.src,
        });
        match self.dispatch(&request.method, &request.params) {
            Ok(result) => response["result"] = result,
            Err(error) => response["error"] = error.to_json(),
        }
        response
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub src: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// HTTP GET query values arrive as strings; numbers and booleans are decoded
/// the way the device does.
fn query_params(query: HashMap<String, String>) -> Value {
    let params = query
        .into_iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            (key, value)
        })
        .collect::<Map<String, Value>>();
    Value::Object(params)
}

async fn shelly_info(State(state): State<ShellyState>) -> Json<Value> {
    Json(device_info(&state.identity))
}

async fn get_rpc(
    State(state): State<ShellyState>,
    Path(method): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match state.dispatch(&method, &query_params(query)) {
        Ok(result) => Json(result).into_response(),
        Err(error) => {
            debug!("RPC {method} failed: {}", error.message);
            error.into_response()
        }
    }
}

async fn post_rpc(
    State(state): State<ShellyState>,
    Json(request): Json<RpcRequest>,
) -> Json<Value> {
    debug!("HTTP RPC: method={} id={}", request.method, request.id);
    Json(state.envelope(request))
}

async fn websocket_rpc(ws: WebSocketUpgrade, State(state): State<ShellyState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ShellyState) {
    info!("WebSocket /rpc: client connected");
    while let Some(message) = socket.recv().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let request: RpcRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                warn!("WebSocket /rpc: ignoring unparseable frame: {e}");
                continue;
            }
        };
        debug!(
            "WebSocket RPC: method={} id={} src={}",
            request.method, request.id, request.src
        );
        let response = state.envelope(request);
        if socket.send(Message::Text(response.to_string())).await.is_err() {
            break;
        }
    }
    info!("WebSocket /rpc: client disconnected");
}

pub fn router(state: ShellyState) -> Router {
    Router::new()
        .route("/shelly", get(shelly_info))
        .route("/rpc", get(websocket_rpc).post(post_rpc))
        .route("/rpc/:method", get(get_rpc))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serves the Shelly API and, optionally, announces it over mDNS.
pub struct ShellyFrontend {
    state: ShellyState,
    mdns: bool,
    advertiser: Option<Advertiser>,
}

impl ShellyFrontend {
    pub fn new(config: &ShellyConfig, store: SnapshotStore) -> Result<Self, ConfigError> {
        let mac = match &config.mac {
            Some(mac) => mac.parse()?,
            None => {
                let mac = MacAddress::from_hostname();
                info!("No MAC configured, generated {mac} from host name");
                mac
            }
        };
        let identity = identity(mac, store.phases());
        Ok(Self {
            state: ShellyState::new(identity, store),
            mdns: config.mdns,
            advertiser: None,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.state.identity
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Starts mDNS advertisement. Failure is logged and HTTP keeps serving.
    pub fn start(&mut self, port: u16) {
        if !self.mdns {
            info!("mDNS advertisement disabled");
            return;
        }
        match Advertiser::start(&advertisement(self.identity(), port)) {
            Ok(advertiser) => self.advertiser = Some(advertiser),
            Err(e) => warn!("mDNS advertisement unavailable, continuing without it: {e}"),
        }
    }

    pub fn stop(&mut self) {
        if let Some(advertiser) = self.advertiser.take() {
            advertiser.stop();
        }
    }
}

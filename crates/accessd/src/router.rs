//! Parses incoming frames, dispatches by command tag, shapes replies;
//! hosts the RTT heartbeat.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::enrollment::{AdvanceOutcome, StartError};
use crate::protocol::{
    cloudtime_now, AdminAddUserFrame, AdminDeleteUserFrame, AdminGetUserFrame,
    AdminSearchUserByNameFrame, AdminSetActiveFrame, LiveScanTelemetry, LivenessTelemetry,
    LogRecord, PingFrame, RegFrame, SendLogFrame, SendUserFrame,
};
use crate::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    let (mut sink, mut stream) = futures::StreamExt::split(socket);
    let (tx, mut rx) = unbounded_channel::<Message>();
    let (close_tx, mut close_rx) = oneshot::channel::<()>();
    let mut close_tx = Some(close_tx);

    let outbound = tokio::spawn(async move {
        use futures::SinkExt;
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut device_serial: Option<String> = None;

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                tracing::info!("router: session superseded, closing");
                break;
            }
            msg = futures::StreamExt::next(&mut stream) => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    tracing::debug!("router: dropping malformed (non-JSON) frame");
                    continue;
                };
                let Some(cmd) = frame.get("cmd").and_then(Value::as_str) else {
                    tracing::debug!("router: dropping frame with no cmd field");
                    continue;
                };

                if let Some(serial) =
                    dispatch(cmd, &frame, session_id, &tx, &state, &mut close_tx).await
                {
                    device_serial = Some(serial);
                }
            }
        }
    }

    let superseded_serial = state.sessions.unregister(session_id);
    let serial = device_serial.or(superseded_serial);
    if let Some(serial) = serial {
        if state.enrollment.cancel(&serial) {
            tracing::info!(serial, "enrollment cancelled on device disconnect");
        }
    }
    outbound.abort();
}

/// Returns `Some(serial)` the first time this session registers as a
/// device, so the caller can remember it for disconnect cleanup.
async fn dispatch(
    cmd: &str,
    frame: &Value,
    session_id: Uuid,
    tx: &tokio::sync::mpsc::UnboundedSender<Message>,
    state: &Arc<AppState>,
    close_tx: &mut Option<oneshot::Sender<()>>,
) -> Option<String> {
    match cmd {
        "reg" => {
            let Ok(reg) = serde_json::from_value::<RegFrame>(frame.clone()) else {
                return None;
            };
            state
                .sessions
                .register_device(&reg.sn, session_id, tx.clone(), close_tx.take());
            let ack = json!({
                "ret": "reg",
                "result": true,
                "cloudtime": cloudtime_now(),
                "nosenduser": false,
            });
            let _ = tx.send(Message::Text(ack.to_string().into()));
            tracing::info!(serial = reg.sn, "device registered");
            Some(reg.sn)
        }
        "sendlog" => {
            let Ok(log) = serde_json::from_value::<SendLogFrame>(frame.clone()) else {
                return None;
            };
            handle_sendlog(log, session_id, tx, state).await;
            None
        }
        "senduser" => {
            let Ok(req) = serde_json::from_value::<SendUserFrame>(frame.clone()) else {
                return None;
            };
            handle_senduser(req, tx, state).await;
            None
        }
        "ping" => {
            if let Ok(ping) = serde_json::from_value::<PingFrame>(frame.clone()) {
                let pong = json!({"ret": "pong", "ts": ping.ts});
                let _ = tx.send(Message::Text(pong.to_string().into()));
            }
            None
        }
        "admin_ping" => {
            if let Ok(ping) = serde_json::from_value::<PingFrame>(frame.clone()) {
                let pong = json!({"ret": "admin_ping", "result": true, "ts": ping.ts});
                let _ = tx.send(Message::Text(pong.to_string().into()));
            }
            None
        }
        "admin_hello" => {
            state.sessions.register_operator(session_id, tx.clone());
            let greeting = json!({"ret": "admin_hello", "result": true});
            let _ = tx.send(Message::Text(greeting.to_string().into()));

            let ack = json!({
                "ret": "reg",
                "result": true,
                "cloudtime": cloudtime_now(),
                "nosenduser": false,
            });
            state.sessions.broadcast_to_devices(&ack);
            None
        }
        "admin_list_devices" => {
            let serials = state.sessions.list_device_serials();
            let reply = json!({"ret": "admin_list_devices", "result": true, "devices": serials});
            let _ = tx.send(Message::Text(reply.to_string().into()));
            None
        }
        "admin_add_user" => {
            handle_admin_add_user(frame, tx, state).await;
            None
        }
        "admin_delete_user" => {
            handle_admin_delete_user(frame, tx, state).await;
            None
        }
        "admin_set_active" => {
            handle_admin_set_active(frame, tx, state).await;
            None
        }
        "admin_get_user" => {
            handle_admin_get_user(frame, tx, state);
            None
        }
        "admin_search_user_by_name" => {
            handle_admin_search_user_by_name(frame, tx, state).await;
            None
        }
        other => {
            tracing::warn!(cmd = other, "router: unknown command");
            None
        }
    }
}

fn decode_b64_image(encoded: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()
        .filter(|bytes| !bytes.is_empty())
}

fn is_stale(record: &LogRecord, staleness_secs: i64) -> bool {
    let Ok(record_time) = chrono::NaiveDateTime::parse_from_str(&record.time, "%Y-%m-%d %H:%M:%S")
    else {
        return false;
    };
    let age = Utc::now().naive_utc() - record_time;
    age > ChronoDuration::seconds(staleness_secs)
}

async fn handle_sendlog(
    log: SendLogFrame,
    session_id: Uuid,
    tx: &tokio::sync::mpsc::UnboundedSender<Message>,
    state: &Arc<AppState>,
) {
    let _ = session_id;
    for record in &log.record {
        if is_stale(record, state.config.log_staleness_secs) {
            send_purge(&log.sn, tx, state);
            continue;
        }

        let note_msg = record
            .note
            .as_ref()
            .and_then(|n| n.msg.as_deref())
            .unwrap_or("");

        if note_msg.contains("system boot") {
            continue;
        }

        if note_msg.contains("fp verify fail") {
            reply_sendlog(tx, 0, "Fingerprint Unavailable");
            continue;
        }

        let Some(image_b64) = &record.image else {
            continue;
        };

        if state.enrollment.is_pending(&log.sn) {
            handle_enrollment_shot(&log.sn, image_b64, tx, state).await;
            continue;
        }

        if note_msg == "face not found" {
            handle_recognition(&log.sn, image_b64, tx, state).await;
        }
    }
}

fn send_purge(serial: &str, tx: &tokio::sync::mpsc::UnboundedSender<Message>, state: &Arc<AppState>) {
    reply_sendlog(tx, 0, "Stale record");
    let cleanuser = json!({"cmd": "cleanuser"});
    let cleanlog = json!({"cmd": "cleanlog"});
    state.sessions.send_to_device(serial, &cleanuser);
    state.sessions.send_to_device(serial, &cleanlog);
}

fn reply_sendlog(tx: &tokio::sync::mpsc::UnboundedSender<Message>, access: u8, message: &str) {
    let reply = json!({
        "ret": "sendlog",
        "access": access,
        "message": message,
        "cloudtime": cloudtime_now(),
    });
    let _ = tx.send(Message::Text(reply.to_string().into()));
}

async fn handle_enrollment_shot(
    serial: &str,
    image_b64: &str,
    tx: &tokio::sync::mpsc::UnboundedSender<Message>,
    state: &Arc<AppState>,
) {
    let Some(image_bytes) = decode_b64_image(image_b64) else {
        return;
    };

    match state.enrollment.advance(serial) {
        AdvanceOutcome::NoPendingEnrollment => {}
        AdvanceOutcome::TimedOut => {
            let cleanuser = json!({"cmd": "cleanuser"});
            let cleanlog = json!({"cmd": "cleanlog"});
            state.sessions.send_to_device(serial, &cleanuser);
            state.sessions.send_to_device(serial, &cleanlog);
            tracing::info!(serial, "enrollment timed out");
        }
        AdvanceOutcome::Progressing { shots_remaining } => {
            tracing::info!(serial, shots_remaining, "enrollment shot recorded");
        }
        AdvanceOutcome::Complete { enroll_id, name, is_admin } => {
            if let Err(e) = state
                .store
                .upsert_user(enroll_id, &name, crate::store::FACE_BACKUP_NUM, is_admin, &image_bytes)
                .await
            {
                tracing::error!(error = %e, enroll_id, "enrollment: final image persist failed");
                return;
            }
            match state.engine.embed(&image_bytes, false).await {
                Ok(embedding) => {
                    state.engine.gallery().upsert(enroll_id, embedding, name.clone(), true);
                }
                Err(e) => {
                    tracing::error!(error = %e, enroll_id, "enrollment: embed for gallery commit failed");
                }
            }

            reply_sendlog(tx, 0, "Enrollment Complete");
            let complete = crate::protocol::EnrollCompleteTelemetry {
                ret: "admin_enroll_complete",
                enroll_id,
                username: name,
                device_sn: serial.to_string(),
            };
            state
                .sessions
                .broadcast_to_operators(&serde_json::to_value(complete).unwrap());
            tracing::info!(serial, enroll_id, "enrollment complete");
        }
    }
}

async fn handle_recognition(
    serial: &str,
    image_b64: &str,
    tx: &tokio::sync::mpsc::UnboundedSender<Message>,
    state: &Arc<AppState>,
) {
    let Some(image_bytes) = decode_b64_image(image_b64) else {
        reply_sendlog(tx, 0, "Access Denied");
        return;
    };

    let result = state
        .engine
        .match_probe(
            &image_bytes,
            state.config.recognize_with_liveness,
            state.config.similarity_threshold,
        )
        .await;

    let result = match result {
        Ok(result) => result,
        Err(e) => {
            tracing::debug!(error = %e, serial, "recognition: no embedding produced");
            reply_sendlog(tx, 0, "Access Denied");
            return;
        }
    };

    let user = state.engine.gallery().user(result.enroll_id);
    let (access, message, is_active, user_name, has_face) = match (&user, result.matched) {
        (Some(user), true) if user.is_active => (1u8, format!("Welcome {}", user.name), true, user.name.clone(), true),
        (Some(user), true) => (0u8, format!("User inactive: {}", user.name), false, user.name.clone(), true),
        _ => (0u8, "Access Denied".to_string(), false, String::new(), false),
    };

    if access == 1 {
        if let Err(e) = state
            .store
            .log_attendance(result.enroll_id, serial, state.config.attendance_debounce_secs)
            .await
        {
            tracing::error!(error = %e, enroll_id = result.enroll_id, "attendance log failed");
        }
    }

    reply_sendlog(tx, access, &message);

    let liveness = state.engine.latest_liveness().map(|record| LivenessTelemetry {
        score: record.real_prob,
        prob: record.real_prob,
        time_ms: record.elapsed_ms,
    });

    let telemetry = LiveScanTelemetry {
        ret: "live_scan",
        device_sn: serial.to_string(),
        device_ip: String::new(),
        time: cloudtime_now(),
        matched: result.matched,
        match_score: result.score,
        enroll_id: result.enroll_id,
        user_name,
        is_active,
        has_face,
        liveness,
    };
    state
        .sessions
        .broadcast_to_operators(&serde_json::to_value(telemetry).unwrap());
}

async fn handle_senduser(
    req: SendUserFrame,
    tx: &tokio::sync::mpsc::UnboundedSender<Message>,
    state: &Arc<AppState>,
) {
    let Some(image_bytes) = decode_b64_image(&req.record) else {
        let reply = json!({"ret": "senduser", "result": false, "error": "invalid image data"});
        let _ = tx.send(Message::Text(reply.to_string().into()));
        return;
    };

    // Legacy path re-generates the id rather than using the device-supplied
    // one; see DESIGN.md for why this matches the upstream behavior.
    let enroll_id = match state.store.next_enroll_id().await {
        Ok(id) => id,
        Err(e) => {
            let reply = json!({"ret": "senduser", "result": false, "error": e.to_string()});
            let _ = tx.send(Message::Text(reply.to_string().into()));
            return;
        }
    };

    if let Err(e) = state
        .store
        .upsert_user(enroll_id, &req.name, req.backupnum, req.admin, &image_bytes)
        .await
    {
        let reply = json!({"ret": "senduser", "result": false, "error": e.to_string()});
        let _ = tx.send(Message::Text(reply.to_string().into()));
        return;
    }

    match state.engine.embed(&image_bytes, false).await {
        Ok(embedding) => {
            state
                .engine
                .gallery()
                .upsert(enroll_id, embedding, req.name.clone(), true);
        }
        Err(e) => {
            tracing::error!(error = %e, enroll_id, "senduser: embed for gallery commit failed");
        }
    }

    let reply = json!({"ret": "senduser", "result": true, "enrollId": enroll_id});
    let _ = tx.send(Message::Text(reply.to_string().into()));
}

async fn handle_admin_add_user(
    frame: &Value,
    tx: &tokio::sync::mpsc::UnboundedSender<Message>,
    state: &Arc<AppState>,
) {
    let Ok(req) = serde_json::from_value::<AdminAddUserFrame>(frame.clone()) else {
        let reply = json!({"ret": "admin_add_user", "result": false, "error": "malformed request"});
        let _ = tx.send(Message::Text(reply.to_string().into()));
        return;
    };

    let device_connected = state.sessions.is_device_connected(&req.device_sn);
    let enroll_id = match state.store.next_enroll_id().await {
        Ok(id) => id,
        Err(e) => {
            let reply = json!({"ret": "admin_add_user", "result": false, "error": e.to_string()});
            let _ = tx.send(Message::Text(reply.to_string().into()));
            return;
        }
    };
    let already_has_face_data = state.store.has_face_data(enroll_id).await.unwrap_or(false);

    match state.enrollment.start(
        &req.device_sn,
        enroll_id,
        req.name.clone(),
        req.is_admin,
        device_connected,
        already_has_face_data,
    ) {
        Ok(()) => {
            let reply = json!({"ret": "admin_add_user", "result": true, "enrollId": enroll_id});
            let _ = tx.send(Message::Text(reply.to_string().into()));
        }
        Err(err) => {
            let message = match err {
                StartError::DeviceNotConnected => "device not connected",
                StartError::AlreadyPending => "enrollment already pending for this device",
                StartError::AlreadyHasFaceData => "enroll id already has face data",
            };
            let reply = json!({"ret": "admin_add_user", "result": false, "error": message});
            let _ = tx.send(Message::Text(reply.to_string().into()));
        }
    }
}

async fn handle_admin_delete_user(
    frame: &Value,
    tx: &tokio::sync::mpsc::UnboundedSender<Message>,
    state: &Arc<AppState>,
) {
    let Ok(req) = serde_json::from_value::<AdminDeleteUserFrame>(frame.clone()) else {
        return;
    };
    let result = state.store.delete_user(req.enroll_id).await;
    state.engine.gallery().remove(req.enroll_id);
    let reply = match result {
        Ok(()) => json!({"ret": "admin_delete_user", "result": true}),
        Err(e) => json!({"ret": "admin_delete_user", "result": false, "error": e.to_string()}),
    };
    let _ = tx.send(Message::Text(reply.to_string().into()));
}

async fn handle_admin_set_active(
    frame: &Value,
    tx: &tokio::sync::mpsc::UnboundedSender<Message>,
    state: &Arc<AppState>,
) {
    let Ok(req) = serde_json::from_value::<AdminSetActiveFrame>(frame.clone()) else {
        return;
    };
    let result = state.store.set_user_active(req.enroll_id, req.is_active).await;
    state.engine.gallery().set_active(req.enroll_id, req.is_active);
    let reply = match result {
        Ok(()) => json!({"ret": "admin_set_active", "result": true}),
        Err(e) => json!({"ret": "admin_set_active", "result": false, "error": e.to_string()}),
    };
    let _ = tx.send(Message::Text(reply.to_string().into()));
}

fn handle_admin_get_user(
    frame: &Value,
    tx: &tokio::sync::mpsc::UnboundedSender<Message>,
    state: &Arc<AppState>,
) {
    let Ok(req) = serde_json::from_value::<AdminGetUserFrame>(frame.clone()) else {
        return;
    };
    let reply = match state.engine.gallery().user(req.enroll_id) {
        Some(user) => json!({
            "ret": "admin_get_user",
            "result": true,
            "enrollId": user.enroll_id,
            "name": user.name,
            "hasFace": user.has_face,
            "isActive": user.is_active,
        }),
        None => json!({"ret": "admin_get_user", "result": false, "error": "user not found"}),
    };
    let _ = tx.send(Message::Text(reply.to_string().into()));
}

async fn handle_admin_search_user_by_name(
    frame: &Value,
    tx: &tokio::sync::mpsc::UnboundedSender<Message>,
    state: &Arc<AppState>,
) {
    let Ok(req) = serde_json::from_value::<AdminSearchUserByNameFrame>(frame.clone()) else {
        return;
    };
    let reply = match state.store.search_users_by_name(&req.name).await {
        Ok(users) => json!({"ret": "admin_search_user_by_name", "result": true, "users": users}),
        Err(e) => json!({"ret": "admin_search_user_by_name", "result": false, "error": e.to_string()}),
    };
    let _ = tx.send(Message::Text(reply.to_string().into()));
}

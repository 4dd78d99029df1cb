//! Inbound HTTP audit middleware.
//!
//! Outermost layer: every request produces one `http` audit record
//! carrying method, path, status, and the hashed session id when a
//! later layer validated one.

use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::api::types::{ApiContext, SessionContext};
use crate::audit::{AuditKind, AuditRecord, AuditSeverity};

pub async fn log_request(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let ctx = req.extensions().get::<ApiContext>().cloned();

    let response = next.run(req).await;

    if let Some(ctx) = ctx {
        let status = response.status().as_u16();
        let severity = if response.status().is_server_error() {
            AuditSeverity::Error
        } else {
            AuditSeverity::Info
        };
        let mut record = AuditRecord::new(
            AuditKind::Http,
            severity,
            &path,
            &method,
            &format!("status:{status}"),
        );
        // The auth layer runs inside this one; a validated session is
        // visible on the response extensions it propagated.
        if let Some(session) = response.extensions().get::<SessionContext>() {
            record = record.with_session(&session.session_id);
        }
        ctx.audit.emit(record);
    }

    response
}

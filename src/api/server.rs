//! Server lifecycle: bind → serve → graceful shutdown.
//!
//! On SIGINT/SIGTERM the listener stops accepting, in-flight requests
//! get a brief drain window, tool clients are closed with their
//! shutdown protocol, and the audit sink is flushed last.

use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::api::router::api_router;
use crate::api::types::ApiContext;

/// Bind the configured address.
pub async fn bind(ctx: &ApiContext) -> std::io::Result<TcpListener> {
    let addr = format!("{}:{}", ctx.config.host, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    Ok(listener)
}

/// Serve until the shutdown future resolves, then drain and release
/// every component in dependency order.
pub async fn run(
    ctx: ApiContext,
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = api_router(ctx.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    tracing::info!("closing tool clients");
    ctx.pool.shutdown().await;
    tracing::info!("flushing audit sink");
    ctx.audit.shutdown();
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn test_ctx(dir: &tempfile::TempDir) -> ApiContext {
        let audit_dir = dir.path().join("audit").display().to_string();
        let scratch_dir = dir.path().join("scratch").display().to_string();
        let pairs: Vec<(&str, String)> = vec![
            ("ENCRYPTION_KEY", "server-test-key".to_string()),
            ("JWT_SECRET", "server-test-secret".to_string()),
            ("AUDIT_LOG_DIR", audit_dir),
            ("IMAGE_SCRATCH_DIR", scratch_dir),
            ("PORT", "0".to_string()),
        ];
        let config = AppConfig::from_lookup(&|key| {
            pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| v.clone())
        })
        .unwrap();
        ApiContext::build(config).unwrap()
    }

    #[tokio::test]
    async fn serves_requests_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let listener = bind(&ctx).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(run(ctx, listener, async move {
            let _ = rx.await;
        }));

        let response = reqwest::get(format!("http://{addr}/api/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "Meridian");

        // Protected route without a token still gets the error shape.
        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{addr}/api/medical/tools"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

        let _ = tx.send(());
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn session_flow_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(&dir);
        let listener = bind(&ctx).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(run(ctx, listener, async move {
            let _ = rx.await;
        }));

        let client = reqwest::Client::new();
        let session: serde_json::Value = client
            .post(format!("http://{addr}/api/session"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let token = session["token"].as_str().unwrap();

        let health = client
            .get(format!("http://{addr}/api/medical/health"))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);

        let _ = tx.send(());
        server.await.unwrap().unwrap();
    }
}

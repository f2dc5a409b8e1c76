//! TCP accept loop and WebSocket upgrade
//!
//! Each accepted stream is upgraded on its own task. The session token is
//! resolved inside the handshake callback so an unauthenticated client gets
//! a 401 and never becomes a connection.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionSettings};
use crate::error::AppError;
use crate::hub::HubHandle;
use crate::identity::{session_token, IdentityResolver};
use crate::types::{ConnectionId, Identity};

/// Accept connections forever
pub async fn serve(
    listener: TcpListener,
    hub: HubHandle,
    resolver: Arc<dyn IdentityResolver>,
    settings: ConnectionSettings,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("New TCP connection from {}", addr);
                let hub = hub.clone();
                let resolver = resolver.clone();

                tokio::spawn(async move {
                    match accept_connection(stream, hub, resolver, settings).await {
                        Ok(_) => {}
                        Err(AppError::Unauthorized) => {
                            info!("Rejected unauthenticated connection from {}", addr)
                        }
                        Err(e) => warn!("Handshake with {} failed: {}", addr, e),
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Upgrade one stream, resolve its identity and start the connection
pub async fn accept_connection(
    stream: TcpStream,
    hub: HubHandle,
    resolver: Arc<dyn IdentityResolver>,
    settings: ConnectionSettings,
) -> Result<ConnectionId, AppError> {
    let mut identity: Option<Identity> = None;

    let authenticate = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match session_token(request).and_then(|token| resolver.resolve(&token)) {
            Some(resolved) => {
                identity = Some(resolved);
                Ok(response)
            }
            None => Err(unauthorized()),
        }
    };

    let ws = accept_hdr_async(stream, authenticate).await;
    let Some(identity) = identity else {
        return Err(AppError::Unauthorized);
    };
    let ws = ws?;

    let connection = Connection::new(ws, identity.clone(), hub, settings);
    let id = connection.id();
    connection.start();

    info!(
        connection_id = %id,
        user_id = %identity.user_id,
        "Connection established for {}",
        identity.display_name
    );

    Ok(id)
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Unauthorized".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

//! Daemon mode
//!
//! Runs the service loop and exposes it on the control socket until a
//! shutdown request or Ctrl+C.

use anyhow::Result;
use tracing::{error, info, warn};

use crate::ipc::{IpcConnection, IpcRequest, IpcResponse, IpcServer};
use crate::retry::RetryPolicy;
use crate::service::{Service, ServiceHandle};
use crate::store::ConfigStore;

/// Run the daemon in the foreground
pub async fn run(store: ConfigStore, policy: RetryPolicy, connect_on_start: bool) -> Result<()> {
    info!("Daemon starting...");

    let socket_path = store.socket_path();
    let server = IpcServer::bind_to(&socket_path).await?;
    info!("IPC server listening at {:?}", server.path());

    let (handle, mut service_task) = Service::new(store, policy)?.spawn();

    if connect_on_start {
        match handle.connect().await {
            Ok(attempt) => info!("Connecting on start ({})", attempt),
            Err(e) => warn!("Not connecting on start: {}", e),
        }
    }

    let ipc_task = tokio::spawn(serve(server, handle.clone()));

    info!("Daemon ready");
    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        result = &mut service_task => {
            if let Err(e) = result {
                error!("Service task failed: {}", e);
            }
            false
        }
    };

    if interrupted {
        info!("Shutdown requested (Ctrl+C)");
        let _ = handle.shutdown().await;
        let _ = service_task.await;
    }

    // Dropping the server removes the socket file
    ipc_task.abort();
    let _ = ipc_task.await;

    info!("Daemon stopped");
    Ok(())
}

/// Accept control connections until the task is aborted
pub async fn serve(server: IpcServer, handle: ServiceHandle) {
    loop {
        match server.accept().await {
            Ok(conn) => {
                tokio::spawn(serve_connection(conn, handle.clone()));
            }
            Err(e) => {
                error!("IPC accept error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_connection(mut conn: IpcConnection, handle: ServiceHandle) {
    loop {
        let request = match conn.recv().await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                warn!("IPC recv error: {}", e);
                let _ = conn
                    .send(&IpcResponse::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let shutdown = request == IpcRequest::Shutdown;
        let response = handle_request(request, &handle).await;
        if let Err(e) = conn.send(&response).await {
            warn!("IPC send error: {}", e);
            return;
        }
        if shutdown {
            let _ = handle.shutdown().await;
            return;
        }
    }
}

/// Translate one control request into a service call
pub async fn handle_request(request: IpcRequest, handle: &ServiceHandle) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::Pong,

        IpcRequest::Connect => match handle.connect().await {
            Ok(attempt) => IpcResponse::Ok {
                message: Some(format!("Connecting ({})", attempt)),
            },
            Err(e) => IpcResponse::Error {
                message: e.to_string(),
            },
        },

        IpcRequest::Disconnect => match handle.disconnect().await {
            Ok(()) => IpcResponse::Ok { message: None },
            Err(e) => IpcResponse::Error {
                message: e.to_string(),
            },
        },

        IpcRequest::Status => match handle.status().await {
            Ok(status) => IpcResponse::Status { status },
            Err(e) => IpcResponse::Error {
                message: e.to_string(),
            },
        },

        // The caller stops the service after the reply is sent
        IpcRequest::Shutdown => IpcResponse::Ok {
            message: Some("Daemon shutting down".to_string()),
        },
    }
}

use fleetlock_gateway::{config, http};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match config::GatewayConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let (app, store) = match http::build(config.clone()).await {
        Ok(built) => built,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(_) => {
            eprintln!("STARTUP_ERROR ERR_BIND_FAILED failed to bind gateway listener");
            std::process::exit(1);
        }
    };

    tracing::info!(
        bind_addr = %config.bind_addr,
        default_page_size = config.default_page_size,
        max_page_size = config.max_page_size,
        rate_limit_window_secs = config.rate_limit_window_secs,
        positions_per_window = config.rate_limit_positions_per_window,
        commands_per_window = config.rate_limit_commands_per_window,
        cors_allow_any_origin = config.cors_allow_any_origin,
        "fleetlock-gateway listening"
    );

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = serve.await {
        eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
        store.close().await;
        std::process::exit(1);
    }

    // Flush pending WAL frames before the process goes away.
    store.close().await;
    tracing::info!("fleetlock-gateway stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("interrupt received, shutting down"),
        _ = terminate => tracing::info!("terminate received, shutting down"),
    }
}

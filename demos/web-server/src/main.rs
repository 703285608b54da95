//! Spreadsheet agent server.
//!
//! Run with: cargo run -p sheet-agents-server -- --agent plan
//!
//! Then open http://localhost:3000 in your browser.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{Json, Router, extract::State, response::Html, routing::get};
use clap::{Parser, ValueEnum};
use sheet_agents_core::{AgentRuntime, SheetBounds};
use sheet_agents_executor::{CellLimitHandler, EchoAgent, PlanAgent};
use sheet_agents_session::{
    Controller, ControllerConfig, ControllerStats, MemoryStore, SchedulerConfig,
};
use sheet_agents_transport::websocket::create_ws_router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Agent backend driven by `schedule_agent`.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum AgentKind {
    /// Replies with the input after a delay.
    Echo,
    /// Applies a JSON execution plan of tool calls.
    Plan,
}

/// Shared-spreadsheet WebSocket server
#[derive(Parser, Debug)]
#[command(name = "sheet-agents-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SHEET_AGENTS_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// Agent invocations allowed to run at once
    #[arg(long, env = "SHEET_AGENTS_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Pending invocations allowed before scheduling is refused
    #[arg(long, env = "SHEET_AGENTS_MAX_QUEUE_DEPTH", default_value_t = 256)]
    max_queue_depth: usize,

    /// Concurrently open sessions
    #[arg(long, env = "SHEET_AGENTS_MAX_SESSIONS", default_value_t = 1024)]
    max_sessions: usize,

    /// Sheet rows
    #[arg(long, default_value_t = 1000)]
    rows: u32,

    /// Sheet columns
    #[arg(long, default_value_t = 26)]
    cols: u32,

    #[arg(long, value_enum, env = "SHEET_AGENTS_AGENT", default_value = "echo")]
    agent: AgentKind,

    /// Reply delay of the echo agent, in milliseconds
    #[arg(long, default_value_t = 1000)]
    echo_delay_ms: u64,

    /// Largest agent write applied without confirmation
    #[arg(long, default_value_t = 1000)]
    max_cells_without_confirmation: u64,

    /// Seconds to wait for an approval decision before denying agent writes
    #[arg(long, default_value_t = 30)]
    approval_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error); `RUST_LOG` takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::default()
            .with_max_sessions(self.max_sessions)
            .with_approval_timeout(Duration::from_secs(self.approval_timeout_secs))
            .with_scheduler(
                SchedulerConfig::default()
                    .with_concurrency(self.concurrency)
                    .with_max_queue_depth(self.max_queue_depth),
            )
    }

    fn runtime(&self) -> Arc<dyn AgentRuntime> {
        match self.agent {
            AgentKind::Echo => Arc::new(EchoAgent::new(Duration::from_millis(self.echo_delay_ms))),
            AgentKind::Plan => Arc::new(PlanAgent),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let store = Arc::new(MemoryStore::new(SheetBounds::new(args.rows, args.cols)));
    let approvals = Arc::new(CellLimitHandler::new(args.max_cells_without_confirmation));
    let controller = Controller::new(store, args.runtime(), approvals, args.controller_config());
    tracing::info!(
        "Sheet {}x{}, agent {:?}, concurrency {}",
        args.rows,
        args.cols,
        args.agent,
        args.concurrency
    );

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .with_state(controller.clone())
        .merge(create_ws_router(controller.clone()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!("Server listening on http://{}", args.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    controller.shutdown();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_handler(State(controller): State<Controller>) -> Json<ControllerStats> {
    Json(controller.stats())
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Sheet Agents - Console</title>
    <style>
        body {
            margin: 0;
            padding: 20px;
            background: #1e1e1e;
            color: #d4d4d4;
            font-family: system-ui, sans-serif;
        }
        h1 { color: #fff; margin-bottom: 10px; }
        textarea, input { font-family: Menlo, Monaco, "Courier New", monospace; }
        #frame { width: 100%; height: 80px; }
        #log {
            height: calc(100vh - 260px);
            overflow-y: auto;
            white-space: pre-wrap;
            font-family: Menlo, Monaco, "Courier New", monospace;
            font-size: 13px;
            border: 1px solid #333;
            padding: 8px;
        }
        .status { color: #888; font-size: 14px; margin-bottom: 10px; }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
    </style>
</head>
<body>
    <h1>Sheet Agents</h1>
    <div class="status" id="status">Connecting...</div>
    <textarea id="frame">{"type":"set_cell","request_id":"1","address":"A1","value":5}</textarea>
    <div><button id="send">Send</button></div>
    <div id="log"></div>

    <script>
        const status = document.getElementById('status');
        const log = document.getElementById('log');
        let ws;

        function append(prefix, text) {
            log.textContent += `${prefix} ${text}\n`;
            log.scrollTop = log.scrollHeight;
        }

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            ws = new WebSocket(`${protocol}//${window.location.host}/ws`);

            ws.onopen = () => {
                status.textContent = 'Connected';
                status.className = 'status connected';
            };

            ws.onclose = () => {
                status.textContent = 'Disconnected - reconnecting...';
                status.className = 'status disconnected';
                setTimeout(connect, 2000);
            };

            ws.onmessage = (event) => append('<', event.data);
        }

        document.getElementById('send').onclick = () => {
            const text = document.getElementById('frame').value;
            if (ws && ws.readyState === WebSocket.OPEN) {
                ws.send(text);
                append('>', text);
            }
        };

        setInterval(() => {
            if (ws && ws.readyState === WebSocket.OPEN) {
                ws.send(JSON.stringify({ type: 'ping' }));
            }
        }, 30000);

        connect();
    </script>
</body>
</html>
"#;

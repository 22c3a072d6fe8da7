use std::{net::SocketAddr, thread};

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::middleware::map_response_with_state;
use axum::response::{IntoResponse, Response};
use camino::Utf8PathBuf;
use console::style;
use tower_http::services::ServeDir;
use tracing::info;

/// Serve `dist` over HTTP on a dedicated thread. HTML responses get the live
/// reload client appended, so nothing extra ends up in the output files.
pub fn start(
    dist: Utf8PathBuf,
    port: u16,
    reload_port: u16,
) -> thread::JoinHandle<Result<(), anyhow::Error>> {
    info!(url = %style(format!("http://localhost:{port}/")).yellow(), "starting a HTTP server");

    thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(serve(dist, port, reload_port))
    })
}

async fn serve(dist: Utf8PathBuf, port: u16, reload_port: u16) -> Result<(), anyhow::Error> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let address = tokio::net::TcpListener::bind(address).await?;

    let router = Router::new()
        .fallback_service(ServeDir::new(dist))
        .layer(map_response_with_state(reload_port, inject_client));

    axum::serve(address, router).await?;

    Ok(())
}

async fn inject_client(State(reload_port): State<u16>, response: Response) -> Response {
    let is_html = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/html"));

    if response.status() != StatusCode::OK || !is_html {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("couldn't buffer response: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let html = inject_script(&String::from_utf8_lossy(&bytes), reload_port);
    parts.headers.remove(header::CONTENT_LENGTH);

    Response::from_parts(parts, Body::from(html))
}

/// Browser side of live reload. `reload` refreshes the page, `inject` swaps
/// stylesheets in place.
pub(crate) fn client_script(reload_port: u16) -> String {
    format!(
        r#"<script>
(() => {{
  const socket = new WebSocket(`ws://${{location.hostname}}:{reload_port}`);
  socket.addEventListener("message", event => {{
    if (event.data === "inject") {{
      for (const link of document.querySelectorAll('link[rel="stylesheet"]')) {{
        const url = new URL(link.href);
        url.searchParams.set("v", Date.now());
        link.href = url.href;
      }}
    }} else {{
      window.location.reload();
    }}
  }});
}})();
</script>"#
    )
}

/// Place the client right before the closing body tag, or at the end.
pub(crate) fn inject_script(html: &str, reload_port: u16) -> String {
    let script = client_script(reload_port);

    match html.to_ascii_lowercase().rfind("</body>") {
        Some(at) => {
            let mut out = String::with_capacity(html.len() + script.len());
            out.push_str(&html[..at]);
            out.push_str(&script);
            out.push_str(&html[at..]);
            out
        }
        None => format!("{html}{script}"),
    }
}

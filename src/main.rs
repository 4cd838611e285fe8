use std::sync::Arc;

use keel::config::Config;
use keel::http::connection::BoxFuture;
use keel::http::context::HttpContext;
use keel::http::request::Method;
use keel::server::{self, Router};
use tracing_subscriber::EnvFilter;

fn hello(ctx: &mut HttpContext) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        ctx.response_headers_mut()?
            .insert("Content-Type", "text/plain");
        ctx.write(b"Hello from Keel\n").await?;
        Ok(())
    })
}

fn echo(ctx: &mut HttpContext) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        let body = ctx.read_body_to_end().await?;
        ctx.response_headers_mut()?
            .insert("Content-Length", body.len().to_string());
        ctx.write(&body).await?;
        Ok(())
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;

    let router = Router::builder()
        .route(Method::GET, "/", hello)
        .route(Method::POST, "/echo", echo)
        .build();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    server::listener::run(&cfg.listen_addr, Arc::new(router), cfg.limits.clone(), shutdown).await
}

use actix_web::{web, HttpServer};
use anyhow::Context;
use dotenvy::dotenv;
use tracing::info;

use fwi_predictor::app::build_app;
use fwi_predictor::artifacts::ArtifactStore;
use fwi_predictor::config::get_configuration;
use fwi_predictor::frontend::Frontend;
use fwi_predictor::telemetry::init_tracing;
use fwi_predictor::AppState;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let settings = get_configuration().context("failed to read configuration")?;
    init_tracing(&settings.log);

    // Refuse to serve anything without a usable scaler/model pair.
    let store = ArtifactStore::load(&settings.artifacts).context("failed to load model artifacts")?;
    info!(model = store.model_kind(), "artifacts ready");

    let state = web::Data::new(AppState::new(
        store,
        Frontend::new(&settings.frontend.dist_dir),
    ));
    let allowed_origins = settings.cors.allowed_origins.clone();

    let address = settings.server.address();
    info!(%address, frontend = %settings.frontend.dist_dir.display(), "starting server");

    let mut server = HttpServer::new(move || build_app(state.clone(), &allowed_origins))
        .bind(&address)
        .with_context(|| format!("failed to bind {}", address))?;
    if let Some(workers) = settings.server.workers {
        server = server.workers(workers);
    }

    server.run().await.context("server error")
}

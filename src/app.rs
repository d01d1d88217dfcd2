use actix_cors::Cors;
use actix_web::{
    body::MessageBody,
    dev::{ServiceFactory, ServiceRequest, ServiceResponse},
    middleware::Logger,
    web, App, Error,
};

use crate::handlers;
use crate::AppState;

/// Browser calls to the API are only accepted from the listed origins.
pub fn cors(allowed_origins: &[String]) -> Cors {
    allowed_origins
        .iter()
        .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
        .allow_any_method()
        .allow_any_header()
        .max_age(3600)
}

/// Assembles the application for one worker. Shared between the server and
/// the integration tests.
pub fn build_app(
    state: web::Data<AppState>,
    allowed_origins: &[String],
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Response = ServiceResponse<impl MessageBody>,
        Config = (),
        InitError = (),
        Error = Error,
    >,
> {
    App::new()
        .app_data(state)
        .wrap(Logger::default())
        .service(
            web::scope("/api")
                .wrap(cors(allowed_origins))
                .service(web::resource("/predict").route(web::post().to(handlers::predict)))
                .service(web::resource("/health").route(web::get().to(handlers::health)))
                .default_service(web::to(handlers::not_found)),
        )
        .service(web::resource("/").route(web::get().to(handlers::index)))
        .service(
            web::resource("/{tail:.*}")
                .route(web::get().to(handlers::frontend_fallback))
                .route(web::head().to(handlers::frontend_fallback))
                .default_service(web::to(handlers::not_found)),
        )
}

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

/// Counts requests, errors, in-flight requests and per-endpoint latency into `AppState`.
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        // Route pattern keeps the endpoint table small; unmatched paths fall back to the raw path.
        let path = req
            .match_pattern()
            .unwrap_or_else(|| req.path().to_string());
        let endpoint = format!("{} {}", req.method(), path);

        let state = req.app_data::<web::Data<AppState>>().cloned();
        // Held by the response future, so a dropped connection still releases it.
        let in_flight = state.as_ref().map(|state| {
            state.increment_request_count();
            state.track_in_flight()
        });

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            drop(in_flight);

            if let Some(state) = state {
                let is_error = match &result {
                    Ok(response) => {
                        response.status().is_client_error() || response.status().is_server_error()
                    }
                    Err(_) => true,
                };
                state.record_endpoint_request(&endpoint, started.elapsed().as_millis() as u64, is_error);
                if is_error {
                    state.increment_error_count();
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::state_in;
    use actix_web::{test, App, HttpResponse};
    use futures_util::FutureExt;

    #[actix_web::test]
    async fn test_requests_and_errors_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route("/ok", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/bad", web::get().to(|| async { HttpResponse::BadRequest().finish() })),
        )
        .await;

        test::call_service(&app, test::TestRequest::get().uri("/ok").to_request()).await;
        test::call_service(&app, test::TestRequest::get().uri("/bad").to_request()).await;

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.request_count, 2);
        assert_eq!(metrics.error_count, 1);
        assert_eq!(metrics.active_requests, 0);
        assert_eq!(metrics.endpoint_metrics["GET /bad"].error_count, 1);
        assert_eq!(metrics.endpoint_metrics["GET /ok"].request_count, 1);
    }

    #[actix_web::test]
    async fn test_abandoned_request_is_no_longer_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_in(dir.path());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(MetricsMiddleware)
                .route(
                    "/stuck",
                    web::get().to(|| async { std::future::pending::<HttpResponse>().await }),
                ),
        )
        .await;

        let mut pending = Box::pin(app.call(test::TestRequest::get().uri("/stuck").to_request()));
        assert!(pending.as_mut().now_or_never().is_none());
        assert_eq!(state.metrics_snapshot().active_requests, 1);

        // Client went away.
        drop(pending);
        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.active_requests, 0);
        assert_eq!(metrics.request_count, 1);
    }
}

use crate::services::auth::Credentials;
use actix_web::{
    Error, FromRequest, HttpResponse,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header,
    web::Data,
};
use actix_web_httpauth::extractors::basic::BasicAuth;
use log::{debug, error};
use std::{
    future::{Future, Ready, ready},
    pin::Pin,
    rc::Rc,
};

pub const AUTH_REALM: &str = "Login Required";

/// HTTP Basic gate in front of the protected routes
///
/// Expects `Data<Credentials>` in the app data. The request body is left
/// untouched so the upload stream still reaches its handler.
pub struct AuthMw;

impl<S, B> Transform<S, ServiceRequest> for AuthMw
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct AuthMiddleware<S> {
    service: Rc<S>,
}

type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static>>;

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();

        Box::pin(async move {
            let Some(credentials) = req.app_data::<Data<Credentials>>().cloned() else {
                error!("credentials missing in app data");
                let http_res = HttpResponse::InternalServerError().finish();
                let (http_req, _) = req.into_parts();
                return Ok(ServiceResponse::new(http_req, http_res).map_into_right_body());
            };

            if verify_request(&req, &credentials).await {
                let res = service.call(req).await?;
                Ok(res.map_into_left_body())
            } else {
                Ok(unauthorized_error(req).map_into_right_body())
            }
        })
    }
}

async fn verify_request(req: &ServiceRequest, credentials: &Credentials) -> bool {
    if !credentials.auth_required() {
        return true;
    }

    let Ok(auth) = BasicAuth::extract(req.request()).await else {
        debug!("no basic credentials on {}", req.path());
        return false;
    };

    let verified = credentials.matches(auth.user_id(), auth.password());
    if !verified {
        debug!("wrong credentials on {}", req.path());
    }

    verified
}

fn unauthorized_error(req: ServiceRequest) -> ServiceResponse {
    let http_res = HttpResponse::Unauthorized()
        .insert_header((
            header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{AUTH_REALM}\""),
        ))
        .finish();
    let (http_req, _) = req.into_parts();
    ServiceResponse::new(http_req, http_res)
}

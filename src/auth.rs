//! Authentication adapters.
//!
//! The core never inspects credentials; adapters turn an HTTP request into
//! a [`UserContext`] (and optionally a [`Session`]), which the middleware
//! stores in the request extensions for the pipeline to consume. Pluggable
//! composition per the capability set: a composite adapter consults its
//! children in order, a null adapter refuses everything.

use actix_web::body::MessageBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::{Error, HttpMessage, HttpRequest};
use async_trait::async_trait;
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

use crate::error::ApiError;
use crate::models::UserContext;
use crate::session::Session;

#[async_trait(?Send)]
pub trait AuthAdapter {
    /// Pulls raw credentials (bearer token, cookie value, ...) off the
    /// request. `None` means this adapter has nothing to say.
    fn extract_credentials(&self, req: &HttpRequest) -> Option<String>;

    /// Resolves credentials into a user. `Ok(None)` means the credentials
    /// are invalid (the request proceeds anonymously); `Err` is an
    /// infrastructure failure.
    async fn validate_credentials(&self, credentials: &str)
        -> Result<Option<UserContext>, ApiError>;

    /// The session bound to these credentials, if the adapter is
    /// session-based.
    async fn get_session(&self, credentials: &str) -> Result<Option<Session>, ApiError>;

    async fn invalidate_session(&self, credentials: &str) -> Result<(), ApiError>;
}

/// Refuses everything. The safe default when no adapter is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuthAdapter;

#[async_trait(?Send)]
impl AuthAdapter for NullAuthAdapter {
    fn extract_credentials(&self, _req: &HttpRequest) -> Option<String> {
        None
    }

    async fn validate_credentials(
        &self,
        _credentials: &str,
    ) -> Result<Option<UserContext>, ApiError> {
        Ok(None)
    }

    async fn get_session(&self, _credentials: &str) -> Result<Option<Session>, ApiError> {
        Ok(None)
    }

    async fn invalidate_session(&self, _credentials: &str) -> Result<(), ApiError> {
        Ok(())
    }
}

/// Consults children in order; the first adapter that extracts credentials
/// handles the request.
pub struct CompositeAuthAdapter {
    children: Vec<Arc<dyn AuthAdapter>>,
}

impl CompositeAuthAdapter {
    pub fn new(children: Vec<Arc<dyn AuthAdapter>>) -> Self {
        Self { children }
    }

    fn responsible(&self, req: &HttpRequest) -> Option<(&Arc<dyn AuthAdapter>, String)> {
        self.children
            .iter()
            .find_map(|child| child.extract_credentials(req).map(|cred| (child, cred)))
    }
}

#[async_trait(?Send)]
impl AuthAdapter for CompositeAuthAdapter {
    fn extract_credentials(&self, req: &HttpRequest) -> Option<String> {
        self.responsible(req).map(|(_, cred)| cred)
    }

    async fn validate_credentials(
        &self,
        credentials: &str,
    ) -> Result<Option<UserContext>, ApiError> {
        for child in &self.children {
            if let Some(user) = child.validate_credentials(credentials).await? {
                return Ok(Some(user));
            }
        }
        Ok(None)
    }

    async fn get_session(&self, credentials: &str) -> Result<Option<Session>, ApiError> {
        for child in &self.children {
            if let Some(session) = child.get_session(credentials).await? {
                return Ok(Some(session));
            }
        }
        Ok(None)
    }

    async fn invalidate_session(&self, credentials: &str) -> Result<(), ApiError> {
        for child in &self.children {
            child.invalidate_session(credentials).await?;
        }
        Ok(())
    }
}

/// actix middleware: resolves the caller and stores `UserContext` /
/// `Session` in the request extensions. Invalid credentials degrade to an
/// anonymous request — the scope layer decides whether that is a 401.
pub struct AuthMiddleware {
    adapter: Rc<dyn AuthAdapter>,
}

impl AuthMiddleware {
    pub fn new(adapter: Rc<dyn AuthAdapter>) -> Self {
        Self { adapter }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = AuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthMiddlewareService {
            service: Rc::new(service),
            adapter: self.adapter.clone(),
        }))
    }
}

pub struct AuthMiddlewareService<S> {
    service: Rc<S>,
    adapter: Rc<dyn AuthAdapter>,
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let adapter = self.adapter.clone();
        Box::pin(async move {
            if let Some(credentials) = adapter.extract_credentials(req.request()) {
                match adapter.validate_credentials(&credentials).await {
                    Ok(Some(user)) => {
                        req.extensions_mut().insert(user);
                        if let Ok(Some(session)) = adapter.get_session(&credentials).await {
                            req.extensions_mut().insert(session);
                        }
                    }
                    Ok(None) => {
                        debug!("Credentials rejected; proceeding anonymously");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            service.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use pretty_assertions::assert_eq;

    /// Static bearer-token adapter for tests.
    struct TokenAdapter {
        token: String,
        user: UserContext,
    }

    #[async_trait(?Send)]
    impl AuthAdapter for TokenAdapter {
        fn extract_credentials(&self, req: &HttpRequest) -> Option<String> {
            req.headers()
                .get("Authorization")?
                .to_str()
                .ok()?
                .strip_prefix("Bearer ")
                .map(str::to_owned)
        }

        async fn validate_credentials(
            &self,
            credentials: &str,
        ) -> Result<Option<UserContext>, ApiError> {
            Ok((credentials == self.token).then(|| self.user.clone()))
        }

        async fn get_session(&self, _credentials: &str) -> Result<Option<Session>, ApiError> {
            Ok(None)
        }

        async fn invalidate_session(&self, _credentials: &str) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn bearer(token: &str) -> HttpRequest {
        TestRequest::default()
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_http_request()
    }

    #[actix_web::test]
    async fn composite_consults_children_in_order() {
        let adapter = CompositeAuthAdapter::new(vec![
            Arc::new(NullAuthAdapter),
            Arc::new(TokenAdapter { token: "tok-1".into(), user: UserContext::new("u1") }),
        ]);

        let req = bearer("tok-1");
        let credentials = adapter.extract_credentials(&req).unwrap();
        assert_eq!(credentials, "tok-1");
        let user = adapter.validate_credentials(&credentials).await.unwrap().unwrap();
        assert_eq!(user.id, "u1");
    }

    #[actix_web::test]
    async fn invalid_credentials_resolve_to_anonymous() {
        let adapter =
            TokenAdapter { token: "tok-1".into(), user: UserContext::new("u1") };
        assert_eq!(adapter.validate_credentials("wrong").await.unwrap(), None);
    }

    #[actix_web::test]
    async fn null_adapter_refuses() {
        let req = bearer("anything");
        assert_eq!(NullAuthAdapter.extract_credentials(&req), None);
    }
}

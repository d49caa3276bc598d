//! Session middleware for profile routes

use crate::bioid::BioIdError;
use crate::AppContext;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{authorization::Bearer, Authorization};
use axum_extra::TypedHeader;

/// Require a session token issued by a successful verification
pub async fn require_session(
    State(context): State<AppContext>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: Request,
    next: Next,
) -> Result<Response, BioIdError> {
    let TypedHeader(auth) = auth_header
        .ok_or_else(|| BioIdError::Unauthorized("Missing session token".to_string()))?;

    let session = context
        .session_manager
        .write()
        .await
        .validate_token(auth.token())?;

    request.extensions_mut().insert(session);

    Ok(next.run(request).await)
}

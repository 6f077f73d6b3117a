use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::{errors::HttpError, transport::http::HttpTransportState, transport::AuthInfo};

/// Bearer-token gate for the transport endpoints. The validated token is
/// stored as an opaque `AuthInfo` extension so it can travel with every
/// message the connection delivers; the engine never inspects it.
pub async fn require_bearer_token(
    State(state): State<HttpTransportState>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: Request,
    next: Next,
) -> Result<Response, HttpError> {
    let Some(TypedHeader(auth)) = auth_header else {
        return Err(HttpError::unauthorized(
            "missing_token",
            "missing authorization header",
        ));
    };

    if auth.token() != state.api_token.as_ref() {
        return Err(HttpError::unauthorized(
            "invalid_token",
            "invalid bearer token",
        ));
    }

    request.extensions_mut().insert(AuthInfo::new(auth.token()));
    Ok(next.run(request).await)
}

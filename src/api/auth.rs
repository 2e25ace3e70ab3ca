/// /auth/* endpoints
use crate::{
    account::{
        AccountView, ActiveSessionInfo, AuthResponse, CurrentSessionResponse,
        GoogleSigninRequest, ListSessionsResponse, MessageResponse, Provenance,
        RefreshTokenRequest, RefreshTokenResponse, RequestPasswordResetRequest,
        ResetPasswordRequest, SessionView, SigninRequest, SignupRequest, SignupResponse,
        VerifyEmailQuery, VerifyEmailResponse,
    },
    api::middleware::JsonBody,
    auth::AuthContext,
    context::AppContext,
    error::AuthResult,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

const RESET_REQUEST_MESSAGE: &str =
    "If an account exists for that email, a password reset link has been sent.";

/// Build auth routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/auth/signup", post(signup))
        .route("/auth/signin", post(signin))
        .route("/auth/signin-with-google", post(signin_with_google))
        .route("/auth/verify-email", post(verify_email))
        .route("/auth/refresh-token", post(refresh_token))
        .route("/auth/request-password-reset", post(request_password_reset))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/signout", post(signout))
        .route("/auth/session", get(current_session))
        .route("/auth/sessions", get(list_sessions))
}

async fn signup(
    State(ctx): State<AppContext>,
    JsonBody(req): JsonBody<SignupRequest>,
) -> AuthResult<(StatusCode, Json<SignupResponse>)> {
    let account = ctx.account_manager.signup(req).await?;

    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            user: AccountView::from(&account),
        }),
    ))
}

async fn signin(
    State(ctx): State<AppContext>,
    provenance: Provenance,
    JsonBody(req): JsonBody<SigninRequest>,
) -> AuthResult<Json<AuthResponse>> {
    let signed_in = ctx.account_manager.signin(req, provenance).await?;
    Ok(Json(AuthResponse::from(&signed_in)))
}

async fn signin_with_google(
    State(ctx): State<AppContext>,
    provenance: Provenance,
    JsonBody(req): JsonBody<GoogleSigninRequest>,
) -> AuthResult<Json<AuthResponse>> {
    let signed_in = ctx
        .account_manager
        .signin_with_google(req, provenance)
        .await?;
    Ok(Json(AuthResponse::from(&signed_in)))
}

async fn verify_email(
    State(ctx): State<AppContext>,
    provenance: Provenance,
    Query(query): Query<VerifyEmailQuery>,
) -> AuthResult<Json<VerifyEmailResponse>> {
    let signed_in = ctx
        .account_manager
        .verify_email(&query.token, provenance)
        .await?;

    Ok(Json(VerifyEmailResponse {
        message: "Email successfully verified".to_string(),
        user: AccountView::from(&signed_in.account),
        session: SessionView::from(&signed_in.session),
    }))
}

async fn refresh_token(
    State(ctx): State<AppContext>,
    provenance: Provenance,
    JsonBody(req): JsonBody<RefreshTokenRequest>,
) -> AuthResult<Json<RefreshTokenResponse>> {
    let rotated = ctx.account_manager.refresh(req, provenance).await?;
    Ok(Json(RefreshTokenResponse::from(rotated)))
}

async fn request_password_reset(
    State(ctx): State<AppContext>,
    JsonBody(req): JsonBody<RequestPasswordResetRequest>,
) -> AuthResult<Json<MessageResponse>> {
    ctx.account_manager.request_password_reset(req).await?;
    Ok(Json(MessageResponse::new(RESET_REQUEST_MESSAGE)))
}

async fn reset_password(
    State(ctx): State<AppContext>,
    JsonBody(req): JsonBody<ResetPasswordRequest>,
) -> AuthResult<Json<MessageResponse>> {
    ctx.account_manager.reset_password(req).await?;
    Ok(Json(MessageResponse::new(
        "Password has been reset. Please sign in with your new password.",
    )))
}

async fn signout(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> AuthResult<Json<MessageResponse>> {
    ctx.account_manager.signout(&auth.session).await?;
    Ok(Json(MessageResponse::new("Signed out")))
}

async fn current_session(auth: AuthContext) -> Json<CurrentSessionResponse> {
    Json(CurrentSessionResponse::from(&auth.session))
}

async fn list_sessions(
    State(ctx): State<AppContext>,
    auth: AuthContext,
) -> AuthResult<Json<ListSessionsResponse>> {
    let sessions = ctx.account_manager.list_sessions(&auth.session).await?;

    Ok(Json(ListSessionsResponse {
        sessions: sessions
            .iter()
            .map(|s| ActiveSessionInfo::from_session(s, &auth.session.session_id))
            .collect(),
    }))
}

//! Axum integration utilities.

use std::fmt;
use std::sync::Arc;

use futures::{SinkExt, StreamExt, future};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::engine::{AccessControl, AccessResponse};
use crate::error::Error;
use crate::hub::{Hub, SubscriberIdentity};
use crate::notify::Notify;
use crate::session::{ClientSession, Frame};
use crate::store::Store;
use crate::types::{CardIdentifier, DeviceId, RoomId};

use ::axum::Json;
use ::axum::Router;
use ::axum::extract::State;
use ::axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use ::axum::http::{HeaderMap, StatusCode, Uri};
use ::axum::response::{IntoResponse, Response};
use ::axum::routing::{get, post};

/// Resolves who is opening a real-time connection.
pub trait ResolveIdentity: Send + Sync + 'static {
    /// Returns the subscriber identity for a WebSocket upgrade request.
    fn resolve(&self, headers: &HeaderMap, uri: &Uri) -> SubscriberIdentity;
}

/// Treats every connection as anonymous.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

impl ResolveIdentity for Anonymous {
    fn resolve(&self, _headers: &HeaderMap, _uri: &Uri) -> SubscriberIdentity {
        SubscriberIdentity::anonymous()
    }
}

/// Shared state for the access-check and WebSocket handlers.
pub struct AccessState<S, N> {
    access: Arc<AccessControl<S, N>>,
    hub: Arc<Hub>,
    identity: Arc<dyn ResolveIdentity>,
}

impl<S, N> Clone for AccessState<S, N> {
    fn clone(&self) -> Self {
        Self {
            access: self.access.clone(),
            hub: self.hub.clone(),
            identity: self.identity.clone(),
        }
    }
}

impl<S, N> fmt::Debug for AccessState<S, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessState")
            .field("subscribers", &self.hub.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl<S, N> AccessState<S, N> {
    /// Creates state that accepts only anonymous subscribers.
    pub fn new(access: Arc<AccessControl<S, N>>, hub: Arc<Hub>) -> Self {
        Self {
            access,
            hub,
            identity: Arc::new(Anonymous),
        }
    }

    /// Sets how subscriber identities are resolved.
    pub fn with_identity(mut self, identity: impl ResolveIdentity) -> Self {
        self.identity = Arc::new(identity);
        self
    }
}

/// Builds a router with `POST /access/check` and `GET /ws`.
pub fn router<S, N>(state: AccessState<S, N>) -> Router
where
    S: Store + 'static,
    N: Notify + 'static,
{
    Router::new()
        .route("/access/check", post(check_access::<S, N>))
        .route("/ws", get(websocket::<S, N>))
        .with_state(state)
}

/// Body of an access-check request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Identifier as read from the card.
    pub card_id: String,
    pub room_id: RoomId,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// JSON error response.
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidId(_) | Error::InvalidPermission(_) => StatusCode::BAD_REQUEST,
            Error::RoomNotFound(_) | Error::CardNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidCardTransition { .. } => StatusCode::CONFLICT,
            Error::Store(_) | Error::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(err = %self.0, "request failed");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Evaluates one access request.
pub async fn check_access<S, N>(
    State(state): State<AccessState<S, N>>,
    Json(request): Json<AccessRequest>,
) -> Result<Json<AccessResponse>, ApiError>
where
    S: Store + 'static,
    N: Notify + 'static,
{
    // Lookups use the identifier as presented.
    let card = CardIdentifier::from_string(request.card_id);
    let device = request.device_id.map(DeviceId::new).transpose()?;
    let check = state
        .access
        .check_access(&card, request.room_id, device.as_ref())
        .await?;
    Ok(Json(AccessResponse::from(check)))
}

/// Upgrades to a WebSocket and streams hub events to the caller.
pub async fn websocket<S, N>(
    State(state): State<AccessState<S, N>>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response
where
    S: Store + 'static,
    N: Notify + 'static,
{
    let identity = state.identity.resolve(&headers, &uri);
    serve(ws, state.hub.clone(), identity)
}

/// Registers an upgraded connection with `hub` as `identity`.
pub fn serve(ws: WebSocketUpgrade, hub: Arc<Hub>, identity: SubscriberIdentity) -> Response {
    let max_message_size = hub.config().max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| run_socket(socket, hub, identity))
}

async fn run_socket(socket: WebSocket, hub: Arc<Hub>, identity: SubscriberIdentity) {
    let subscription = hub.connect(identity);
    let session = ClientSession::new(hub, subscription);
    let id = session.id();

    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, ::axum::Error>(to_message(frame))));
    let stream = stream.map(|message| message.map(from_message));

    let end = session.run(sink, stream).await;
    debug!(subscriber = %id, ?end, "websocket closed");
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data.to_vec()),
        Message::Ping(data) => Frame::Ping(data.to_vec()),
        Message::Pong(data) => Frame::Pong(data.to_vec()),
        Message::Close(_) => Frame::Close,
    }
}

#[cfg(feature = "axum-jwt")]
pub mod jwt {
    use std::fmt;

    use jsonwebtoken::{DecodingKey, Validation, decode};
    use serde::{Deserialize, Serialize};
    use thiserror::Error;
    use tracing::debug;

    use super::ResolveIdentity;
    use crate::hub::SubscriberIdentity;
    use crate::types::UserId;

    use ::axum::extract::Query;
    use ::axum::http::header::AUTHORIZATION;
    use ::axum::http::{HeaderMap, Uri};

    /// Errors returned by JWT identity helpers.
    #[derive(Debug, Error, PartialEq, Eq)]
    pub enum AuthError {
        /// Neither a bearer header nor a `token` query parameter was sent.
        #[error("missing token")]
        MissingToken,
        /// Authorization header format is invalid.
        #[error("invalid authorization header")]
        InvalidAuthorization,
        /// JWT validation error.
        #[error("invalid token")]
        InvalidToken,
    }

    /// Claims carried by subscriber tokens.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Claims {
        pub user_id: UserId,
        #[serde(default)]
        pub is_admin: bool,
        /// Standard JWT expiration.
        pub exp: u64,
    }

    /// Resolves subscribers from HS/RS-signed JWTs.
    #[derive(Clone)]
    pub struct JwtIdentity {
        decoding_key: DecodingKey,
        validation: Validation,
    }

    impl fmt::Debug for JwtIdentity {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("JwtIdentity")
                .field("decoding_key", &"<redacted>")
                .field("validation", &self.validation)
                .finish()
        }
    }

    impl JwtIdentity {
        /// Creates a resolver with the given key and validation rules.
        pub fn new(decoding_key: DecodingKey, validation: Validation) -> Self {
            Self {
                decoding_key,
                validation,
            }
        }

        /// Validates `token` and returns its claims.
        pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
            decode::<Claims>(token, &self.decoding_key, &self.validation)
                .map(|data| data.claims)
                .map_err(|_| AuthError::InvalidToken)
        }
    }

    impl ResolveIdentity for JwtIdentity {
        fn resolve(&self, headers: &HeaderMap, uri: &Uri) -> SubscriberIdentity {
            match request_token(headers, uri).and_then(|token| self.decode(&token)) {
                Ok(claims) => SubscriberIdentity::user(claims.user_id, claims.is_admin),
                Err(err) => {
                    debug!(%err, "connecting anonymous subscriber");
                    SubscriberIdentity::anonymous()
                }
            }
        }
    }

    #[derive(Deserialize)]
    struct TokenQuery {
        token: Option<String>,
    }

    /// Returns the bearer token, falling back to the `token` query parameter.
    pub fn request_token(headers: &HeaderMap, uri: &Uri) -> Result<String, AuthError> {
        match bearer_token(headers) {
            Err(AuthError::MissingToken) => {}
            other => return other,
        }
        Query::<TokenQuery>::try_from_uri(uri)
            .ok()
            .and_then(|Query(query)| query.token)
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)
    }

    fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
        let value = headers.get(AUTHORIZATION).ok_or(AuthError::MissingToken)?;
        let value = value
            .to_str()
            .map_err(|_| AuthError::InvalidAuthorization)?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidAuthorization)?;
        if token.is_empty() {
            return Err(AuthError::InvalidAuthorization);
        }
        Ok(token.to_string())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use ::axum::http::HeaderValue;
        use jsonwebtoken::{EncodingKey, Header, encode};

        const SECRET: &[u8] = b"reader-secret";

        fn token(user: u64, admin: bool) -> String {
            let claims = Claims {
                user_id: UserId::new(user),
                is_admin: admin,
                exp: 4_102_444_800,
            };
            encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
        }

        fn resolver() -> JwtIdentity {
            JwtIdentity::new(DecodingKey::from_secret(SECRET), Validation::default())
        }

        #[test]
        fn bearer_header_wins_over_query() {
            let mut headers = HeaderMap::new();
            let bearer = format!("Bearer {}", token(3, true));
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&bearer).unwrap());
            let uri: Uri = format!("/ws?token={}", token(4, false)).parse().unwrap();

            let identity = resolver().resolve(&headers, &uri);

            assert_eq!(identity, SubscriberIdentity::user(UserId::new(3), true));
        }

        #[test]
        fn query_token_is_accepted() {
            let uri: Uri = format!("/ws?token={}", token(4, false)).parse().unwrap();

            let identity = resolver().resolve(&HeaderMap::new(), &uri);

            assert_eq!(identity, SubscriberIdentity::user(UserId::new(4), false));
        }

        #[test]
        fn bad_or_missing_token_is_anonymous() {
            let uri: Uri = "/ws?token=not-a-jwt".parse().unwrap();
            assert_eq!(
                resolver().resolve(&HeaderMap::new(), &uri),
                SubscriberIdentity::anonymous()
            );

            let uri: Uri = "/ws".parse().unwrap();
            assert_eq!(
                request_token(&HeaderMap::new(), &uri),
                Err(AuthError::MissingToken)
            );
        }

        #[test]
        fn malformed_authorization_header_is_rejected() {
            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));

            assert_eq!(
                request_token(&headers, &"/ws".parse().unwrap()),
                Err(AuthError::InvalidAuthorization)
            );
        }
    }
}

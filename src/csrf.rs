//! Per-session anti-forgery tokens for form submissions.
//!
//! A token is minted the first time a page asks for one and then stays fixed
//! until the session is cleared.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use crate::session::{Session, SessionKey};

const TOKEN_BYTES: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CsrfError {
    #[error("CSRF token missing")]
    Missing,

    #[error("CSRF token invalid")]
    Mismatch,
}

impl IntoResponse for CsrfError {
    fn into_response(self) -> Response {
        warn!(error = %self, "rejected state-changing request");
        (
            StatusCode::FORBIDDEN,
            "Invalid security token. Please reload the page and try again.",
        )
            .into_response()
    }
}

pub struct CsrfGuard;

impl CsrfGuard {
    pub fn token(session: &Session) -> String {
        if let Some(existing) = session.get(SessionKey::CsrfToken) {
            return existing;
        }
        let token = URL_SAFE_NO_PAD.encode(rand::random::<[u8; TOKEN_BYTES]>());
        session.set(SessionKey::CsrfToken, token.clone());
        token
    }

    pub fn validate(session: &Session, submitted: Option<&str>) -> Result<(), CsrfError> {
        let submitted = submitted
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(CsrfError::Missing)?;
        let expected = session.get(SessionKey::CsrfToken).ok_or(CsrfError::Missing)?;

        if bool::from(submitted.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(CsrfError::Mismatch)
        }
    }
}

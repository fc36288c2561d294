#![deny(warnings)]

use {
    anyhow::Error,
    serde_derive::Serialize,
    std::{borrow::Cow, convert::Infallible},
    warp::{
        http::StatusCode,
        reject::{MethodNotAllowed, PayloadTooLarge, Reject},
        reply, Rejection, Reply,
    },
};

#[derive(Serialize)]
#[serde(remote = "StatusCode")]
struct StatusCodeU16(#[serde(getter = "StatusCode::as_u16")] u16);

#[derive(Clone, Serialize, Debug, thiserror::Error)]
#[error("HTTP {}: {}", status, message)]
pub struct HttpError {
    pub message: Cow<'static, str>,
    #[serde(with = "StatusCodeU16")]
    pub status: StatusCode,
}

impl HttpError {
    pub fn from_slice(status: StatusCode, message: &'static str) -> Self {
        Self {
            status,
            message: Cow::Borrowed(message),
        }
    }

    pub fn internal_server_error() -> Self {
        HttpError::from_slice(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }

    pub fn from(error: Error) -> Self {
        if let Some(e) = error.root_cause().downcast_ref::<HttpError>() {
            e.clone()
        } else {
            Self::internal_server_error()
        }
    }

    pub fn as_reply(&self) -> impl Reply {
        reply::with_status(reply::json(&self), self.status)
    }
}

impl Reject for HttpError {}

pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let error = if rejection.is_not_found() {
        HttpError::from_slice(StatusCode::NOT_FOUND, "not found")
    } else if let Some(error) = rejection.find::<HttpError>() {
        error.clone()
    } else if rejection.find::<MethodNotAllowed>().is_some() {
        HttpError::from_slice(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else if rejection.find::<PayloadTooLarge>().is_some() {
        HttpError::from_slice(StatusCode::PAYLOAD_TOO_LARGE, "payload too large")
    } else {
        HttpError::internal_server_error()
    };

    Ok(error.as_reply())
}

#[cfg(test)]
mod test {
    use {super::*, anyhow::anyhow};

    #[test]
    fn root_cause_status_survives() {
        let error = Error::from(HttpError::from_slice(StatusCode::BAD_REQUEST, "bad"))
            .context("while handling request");

        assert_eq!(StatusCode::BAD_REQUEST, HttpError::from(error).status);

        assert_eq!(
            StatusCode::INTERNAL_SERVER_ERROR,
            HttpError::from(anyhow!("disk on fire")).status
        );
    }
}

//! Readiness endpoint reporting whether every configured store accepts writes
use axum::{extract::State, http::StatusCode, routing::get, Router};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::sink::Store;

#[derive(Clone)]
struct Stores {
    stores: Vec<Store>,
    cancel: CancellationToken,
}

pub fn router(stores: Vec<Store>, cancel: CancellationToken) -> Router {
    Router::new()
        .route("/_health", get(readiness))
        .with_state(Stores { stores, cancel })
}

async fn readiness(State(state): State<Stores>) -> (StatusCode, String) {
    let mut unready = Vec::new();
    for store in &state.stores {
        if !store.is_ready(&state.cancel).await {
            unready.push(store.name().to_owned());
        }
    }
    if unready.is_empty() {
        return (StatusCode::OK, String::from("ok"));
    }
    warn!("stores not ready: {}", unready.join(", "));
    (
        StatusCode::SERVICE_UNAVAILABLE,
        format!("not ready: {}", unready.join(", ")),
    )
}

/// Serves `router` until `cancel` fires
pub async fn serve(router: Router, bind: &str, cancel: CancellationToken) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        record::Record,
        sink::{RecordSink, SinkError},
    };

    struct Fixed(bool);

    #[async_trait]
    impl RecordSink for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn insert(&self, _records: &[Record]) -> Result<(), SinkError> {
            Ok(())
        }

        async fn check(&self) -> Result<(), SinkError> {
            match self.0 {
                true => Ok(()),
                false => Err(SinkError::Unavailable(String::from("down"))),
            }
        }
    }

    fn state(up: &[bool]) -> State<Stores> {
        State(Stores {
            stores: up
                .iter()
                .map(|&u| Store::new(Arc::new(Fixed(u))))
                .collect(),
            cancel: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn ready_when_all_stores_are() {
        let (status, body) = readiness(state(&[true, true])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn unavailable_when_any_store_is_down() {
        let (status, body) = readiness(state(&[true, false])).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "not ready: fixed");
    }
}
